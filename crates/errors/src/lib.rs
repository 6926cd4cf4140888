use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("无效的CRON表达式: 字段 {field} 的值 '{raw}' - {message}")]
    InvalidCron {
        field: &'static str,
        raw: String,
        message: String,
    },
    #[error("熔断器处于打开状态，调用被拒绝 (约 {retry_after:?} 后重试)")]
    CircuitOpen { retry_after: Duration },
    #[error("超出限流: 每 {window:?} 最多 {limit} 次调用 (约 {retry_after:?} 后重试)")]
    RateLimited {
        limit: usize,
        window: Duration,
        retry_after: Duration,
    },
    #[error("限流器已销毁")]
    LimiterDestroyed,
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("操作失败: {0}")]
    Operation(#[source] anyhow::Error),
    #[error("{source} (共尝试 {attempts} 次)")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<CadenceError>,
    },
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("任务正在运行: {id}")]
    TaskAlreadyRunning { id: String },
    #[error("任务已取消: {id}")]
    TaskCancelled { id: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CadenceResult<T> = Result<T, CadenceError>;

impl CadenceError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn timeout_error<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn task_not_found(id: impl ToString) -> Self {
        Self::TaskNotFound { id: id.to_string() }
    }
    pub fn invalid_cron<R: Into<String>, M: Into<String>>(
        field: &'static str,
        raw: R,
        message: M,
    ) -> Self {
        Self::InvalidCron {
            field,
            raw: raw.into(),
            message: message.into(),
        }
    }

    /// 调用从未执行（熔断或限流拒绝）
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            CadenceError::CircuitOpen { .. }
                | CadenceError::RateLimited { .. }
                | CadenceError::LimiterDestroyed
        )
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CadenceError::Configuration(_) | CadenceError::InvalidCron { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadenceError::TaskExecution(_)
                | CadenceError::Operation(_)
                | CadenceError::Timeout(_)
                | CadenceError::CircuitOpen { .. }
                | CadenceError::RateLimited { .. }
        )
    }

    /// 重试耗尽时返回最后一次的底层错误，其他情况返回自身
    pub fn into_last_error(self) -> CadenceError {
        match self {
            CadenceError::RetryExhausted { source, .. } => *source,
            other => other,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            CadenceError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CadenceError {
    fn from(err: serde_json::Error) -> Self {
        CadenceError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CadenceError {
    fn from(err: anyhow::Error) -> Self {
        CadenceError::Operation(err)
    }
}
