// 蜡烛数据服务主程序
use candle_server::cdcommon::{logging_setup, Result, ServiceConfig};
use candle_server::cddata::Worker;

use clap::Parser;
use tracing::{error, info};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/CandleServerConfig.toml";

#[derive(Parser, Debug)]
#[command(name = "candle_data_service", about = "实时与历史蜡烛数据服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::from_file(&args.config)?;

    // guard持有到main结束，保证日志落盘
    let _log_guard = logging_setup::init_logging(&config.logging)?;

    info!(target: "main", config_path = %args.config, "蜡烛数据服务启动");

    let mut worker = Worker::new(config)?;
    worker.start().await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!(target: "main", "收到停机信号");
        }
        Err(e) => {
            error!(target: "main", error = %e, "监听停机信号失败");
        }
    }

    worker.stop().await;
    info!(target: "main", "服务已退出");
    Ok(())
}
