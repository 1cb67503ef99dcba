//! 标的集合模块
//!
//! 标的的发现与维护由外部系统负责，这里只定义获取接口。
//! 默认实现从配置读取固定列表

use crate::cdcommon::Result;

/// 标的集合提供方
pub trait UniverseProvider: Send + Sync {
    /// 当前标的列表，顺序稳定且无重复
    fn symbols(&self) -> Result<Vec<String>>;
}

/// 配置驱动的标的集合
#[derive(Debug, Clone)]
pub struct ConfigUniverse {
    symbols: Vec<String>,
}

impl ConfigUniverse {
    /// 去重并保留首次出现的顺序，统一转为大写
    pub fn new(symbols: &[String]) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut deduped = Vec::new();
        for s in symbols {
            let upper = s.trim().to_uppercase();
            if !upper.is_empty() && seen.insert(upper.clone()) {
                deduped.push(upper);
            }
        }
        Self { symbols: deduped }
    }
}

impl UniverseProvider for ConfigUniverse {
    fn symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 去重且保持首次出现顺序
    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let universe = ConfigUniverse::new(&[
            "aapl".to_string(),
            "MSFT".to_string(),
            "AAPL".to_string(),
            " spy ".to_string(),
        ]);
        assert_eq!(universe.symbols().unwrap(), vec!["AAPL", "MSFT", "SPY"]);
    }
}
