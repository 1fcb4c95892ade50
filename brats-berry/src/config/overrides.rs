//! 命令行风格的覆盖项合并.

use super::{Config, ConfigError};
use serde_json::Value;

/// 覆盖项合并策略.
///
/// 两种策略都把缺省 (`null`) 视为 "未提供". 区别在于显式提供的 "假值"
/// (`false`, `0`, 空字符串, 空列表, 空对象) 是否生效.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MergePolicy {
    /// 假值被忽略, 保留原配置. 与旧版脚本的可观察行为一致.
    #[default]
    SkipFalsy,

    /// 只要提供了值就生效, 包括假值.
    Explicit,
}

/// 值是否为 "真值". `null`, `false`, `0`, 空字符串, 空列表和空对象为假.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// 将覆盖项按顺序合并进 `config`, 返回新配置.
///
/// `modalities` 键写入 `training_modalities`, 其余键原样写入.
/// 任一覆盖项的键未知或值类型不匹配时返回 `Err`.
pub fn merge_overrides<I, K>(
    mut config: Config,
    overrides: I,
    policy: MergePolicy,
) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    for (key, value) in overrides {
        let key = key.as_ref();
        if value.is_null() {
            continue;
        }
        if policy == MergePolicy::SkipFalsy && !is_truthy(&value) {
            log::debug!("override `{key}` = {value} is falsy, keeping the configured value");
            continue;
        }
        let target = match key {
            "modalities" => "training_modalities",
            other => other,
        };
        log::debug!("override `{target}` = {value}");
        config.set(target, value)?;
    }
    Ok(config)
}
