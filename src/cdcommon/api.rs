//! 上游REST接口客户端
//!
//! 历史蜡烛接口返回平行数组格式，时间戳以秒为单位，
//! 本模块统一转换为毫秒存储格式。
//! 调用方必须先通过限流器占用额度再调用本模块

use crate::cdcommon::config::ApiConfig;
use crate::cdcommon::error::{AppError, Result};
use crate::cdcommon::models::{Candle, CandleResponse};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// REST接口客户端
#[derive(Debug, Clone)]
pub struct MarketDataApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl MarketDataApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// 拉取历史蜡烛，[from_secs, to_secs]为闭区间秒级时间戳
    ///
    /// 始终请求复权数据。429返回RateLimited，无数据返回DataUnavailable
    #[instrument(skip(self), fields(symbol = %symbol, resolution = %resolution))]
    pub async fn get_candles(
        &self,
        symbol: &str,
        resolution: &str,
        from_secs: i64,
        to_secs: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/stock/candle?symbol={}&resolution={}&from={}&to={}&adjusted=true&token={}",
            self.base_url, symbol, resolution, from_secs, to_secs, self.api_key
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited(format!("上游限流: {}", symbol)));
        }
        if !status.is_success() {
            return Err(AppError::ApiError(format!(
                "历史数据请求失败: {} HTTP {}", symbol, status
            )));
        }

        let body: CandleResponse = response.json().await?;
        let candles = parse_candle_response(symbol, body)?;
        debug!(target: "api", symbol = %symbol, count = candles.len(), "历史蜡烛拉取完成");
        Ok(candles)
    }
}

/// 校验平行数组响应并转换为存储格式
///
/// 时间戳由秒转毫秒；数组长度不一致视为响应损坏
pub fn parse_candle_response(symbol: &str, resp: CandleResponse) -> Result<Vec<Candle>> {
    if resp.status == "no_data" {
        return Err(AppError::DataUnavailable(format!("{} 无数据", symbol)));
    }
    if resp.status != "ok" {
        return Err(AppError::MalformedResponse(format!(
            "{} 响应状态异常: {}", symbol, resp.status
        )));
    }

    let n = resp.timestamps.len();
    if resp.opens.len() != n
        || resp.highs.len() != n
        || resp.lows.len() != n
        || resp.closes.len() != n
        || resp.volumes.len() != n
    {
        return Err(AppError::MalformedResponse(format!(
            "{} 响应数组长度不一致", symbol
        )));
    }

    let mut candles = Vec::with_capacity(n);
    for i in 0..n {
        candles.push(Candle {
            open_time: resp.timestamps[i] * 1000,
            open: resp.opens[i],
            high: resp.highs[i],
            low: resp.lows[i],
            close: resp.closes[i],
            volume: resp.volumes[i],
        });
    }
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 正常响应转换为毫秒时间戳蜡烛
    #[test]
    fn test_parse_ok_response() {
        let resp: CandleResponse = serde_json::from_str(
            r#"{"s":"ok","t":[1700000000,1700000060],"o":[1.0,2.0],"h":[1.5,2.5],"l":[0.5,1.5],"c":[1.2,2.2],"v":[100.0,200.0]}"#,
        ).unwrap();

        let candles = parse_candle_response("AAPL", resp).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1_700_000_000_000);
        assert_eq!(candles[1].close, 2.2);
    }

    /// no_data状态映射为DataUnavailable
    #[test]
    fn test_parse_no_data() {
        let resp: CandleResponse = serde_json::from_str(r#"{"s":"no_data"}"#).unwrap();
        let err = parse_candle_response("AAPL", resp).unwrap_err();
        assert!(matches!(err, AppError::DataUnavailable(_)));
        assert!(!err.is_retryable());
    }

    /// 数组长度不一致映射为MalformedResponse
    #[test]
    fn test_parse_mismatched_arrays() {
        let resp: CandleResponse = serde_json::from_str(
            r#"{"s":"ok","t":[1700000000,1700000060],"o":[1.0],"h":[1.5],"l":[0.5],"c":[1.2],"v":[100.0]}"#,
        ).unwrap();
        let err = parse_candle_response("AAPL", resp).unwrap_err();
        assert!(matches!(err, AppError::MalformedResponse(_)));
    }
}
