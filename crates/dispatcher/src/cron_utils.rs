//! CRON表达式解析与下次执行时间计算
//!
//! 支持5字段 (分 时 日 月 周) 与6字段 (秒 分 时 日 月 周) 两种格式，
//! 每个字段接受 `*`、整数、`a-b`、`a,b,c`、`*/n`、`a-b/n` 以及 `a/n`。
//! 月份与星期可使用英文缩写 (`JAN`、`MON`)，星期中 `7` 等同于周日，
//! 日和周字段可用 `?` 表示不限定。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use tracing::debug;

use cadence_errors::{CadenceError, CadenceResult};

/// 向后搜索的最大年数，覆盖跨世纪的闰日 (如 `0 0 29 2 *`)
const SEARCH_HORIZON_YEARS: i32 = 8;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// 第一个名字对应的数值
    names_offset: u32,
    allows_question_mark: bool,
}

const SECOND: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
    names_offset: 0,
    allows_question_mark: false,
};
const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    ..SECOND
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    max: 23,
    ..SECOND
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day_of_month",
    min: 1,
    max: 31,
    names: &[],
    names_offset: 0,
    allows_question_mark: true,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_offset: 1,
    allows_question_mark: false,
};
// 7 在解析后由 fold_sunday 折叠为 0 (周日)
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day_of_week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_offset: 0,
    allows_question_mark: true,
};

/// 单个字段允许的取值集合，第 n 位表示数值 n
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    /// 大于等于 `value` 的最小取值
    fn next_from(self, value: u32) -> Option<u32> {
        if value >= 64 {
            return None;
        }
        let remaining = self.0 >> value;
        if remaining == 0 {
            None
        } else {
            Some(value + remaining.trailing_zeros())
        }
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn range(min: u32, max: u32) -> Self {
        let mut set = FieldSet(0);
        for value in min..=max {
            set.insert(value);
        }
        set
    }
}

/// 解析后的CRON表达式，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// 日字段是否受限 (不以 `*` 或 `?` 开头)
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expr: &str) -> CadenceResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(CadenceError::invalid_cron(
                    "expression",
                    expr,
                    format!("需要5或6个字段，实际为 {n} 个"),
                ))
            }
        };

        let seconds = parse_field(second, SECOND)?;
        let minutes = parse_field(rest[0], MINUTE)?;
        let hours = parse_field(rest[1], HOUR)?;
        let days_of_month = parse_field(rest[2], DAY_OF_MONTH)?;
        let months = parse_field(rest[3], MONTH)?;
        let days_of_week = fold_sunday(parse_field(rest[4], DAY_OF_WEEK)?);

        let expression = Self {
            source: fields.join(" "),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: days_of_month != FieldSet::range(DAY_OF_MONTH.min, DAY_OF_MONTH.max),
            // 7 已折叠为 0，完整的星期集合是 0-6
            dow_restricted: days_of_week != FieldSet::range(0, 6),
        };

        debug!("解析CRON表达式: {}", expression.source);
        Ok(expression)
    }

    /// 验证CRON表达式是否有效
    pub fn validate(expr: &str) -> CadenceResult<()> {
        Self::parse(expr).map(|_| ())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 日与周均受限时任一满足即可，否则两者都需满足 (不受限的一方恒为真)
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// 给定时间 (秒精度) 是否匹配表达式
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.months.contains(time.month())
            && self.day_matches(time.date_naive())
            && self.hours.contains(time.hour())
            && self.minutes.contains(time.minute())
            && self.seconds.contains(time.second())
    }

    /// 严格晚于 `after` 的第一个匹配时间；搜索范围内无匹配时返回 `None`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + Duration::seconds(1);
        let horizon = NaiveDate::from_ymd_opt(start.year() + SEARCH_HORIZON_YEARS, 1, 1)?;

        let mut date = start.date_naive();
        let mut hour = start.hour();
        let mut minute = start.minute();
        let mut second = start.second();

        loop {
            if date >= horizon {
                debug!("CRON表达式 {} 在 {} 年内没有匹配时间", self.source, SEARCH_HORIZON_YEARS);
                return None;
            }

            if !self.months.contains(date.month()) {
                date = first_day_of_next_month(date)?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            if !self.day_matches(date) {
                date = date.succ_opt()?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            match self.hours.next_from(hour) {
                Some(next) if next != hour => (hour, minute, second) = (next, 0, 0),
                Some(_) => {}
                None => {
                    date = date.succ_opt()?;
                    (hour, minute, second) = (0, 0, 0);
                    continue;
                }
            }

            match self.minutes.next_from(minute) {
                Some(next) if next != minute => (minute, second) = (next, 0),
                Some(_) => {}
                None => {
                    (minute, second) = (0, 0);
                    hour += 1;
                    if hour > 23 {
                        hour = 0;
                        date = date.succ_opt()?;
                    }
                    continue;
                }
            }

            match self.seconds.next_from(second) {
                Some(next) => second = next,
                None => {
                    second = 0;
                    minute += 1;
                    if minute > 59 {
                        minute = 0;
                        hour += 1;
                        if hour > 23 {
                            hour = 0;
                            date = date.succ_opt()?;
                        }
                    }
                    continue;
                }
            }

            let naive = date.and_hms_opt(hour, minute, second)?;
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    /// 从 `from` 之后开始的 `count` 个执行时间
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = from;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now).map(|next| next - now)
    }
}

impl FromStr for CronExpression {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn fold_sunday(mut set: FieldSet) -> FieldSet {
    if set.contains(7) {
        set.0 &= !(1 << 7);
        set.insert(0);
    }
    set
}

fn first_day_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_field(raw: &str, field: FieldSpec) -> CadenceResult<FieldSet> {
    let fail = |message: String| CadenceError::invalid_cron(field.name, raw, message);
    let mut set = FieldSet(0);

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(fail("列表中存在空项".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| fail(format!("无效的步长 '{step}'")))?;
                if step == 0 {
                    return Err(fail("步长必须大于0".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            if range == "?" && !field.allows_question_mark {
                return Err(fail("'?' 只能用于日或周字段".to_string()));
            }
            (field.min, field.max)
        } else if let Some((low, high)) = range.split_once('-') {
            let low = parse_value(low, field).map_err(fail)?;
            let high = parse_value(high, field).map_err(fail)?;
            if low > high {
                return Err(fail(format!("范围起点 {low} 大于终点 {high}")));
            }
            (low, high)
        } else {
            let value = parse_value(range, field).map_err(fail)?;
            // `a/n` 表示从 a 开始直到字段上限
            match step {
                Some(_) => (value, field.max),
                None => (value, value),
            }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set.insert(value);
        }
    }

    Ok(set)
}

fn parse_value(token: &str, field: FieldSpec) -> Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(value) => value,
        Err(_) => field
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|index| index as u32 + field.names_offset)
            .ok_or_else(|| format!("无法识别的值 '{token}'"))?,
    };

    if value < field.min || value > field.max {
        return Err(format!(
            "值 {value} 超出范围 {}-{}",
            field.min, field.max
        ));
    }
    Ok(value)
}
