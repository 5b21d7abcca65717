use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::ebpf_loader::DEFAULT_EBPF_OBJECT;
use crate::state::{SourceMode, WatchdogConfig};

/// Process Watchdog - 进程生命周期跟踪与规则执行
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// 监听端口
    #[arg(short, long, env = "PORT", default_value_t = 9999)]
    pub port: u16,

    /// 监听地址
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// 规则评估周期（毫秒）
    #[arg(long, env = "EVAL_INTERVAL_MS", default_value_t = 1000)]
    pub eval_interval_ms: u64,

    /// 全量对账周期（秒）
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    pub reconcile_interval_secs: u64,

    /// 轮询事件源的扫描周期（毫秒）
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// 事件源
    #[arg(long, env = "EVENT_SOURCE", value_enum, default_value_t = SourceMode::Auto)]
    pub event_source: SourceMode,

    /// eBPF 目标文件
    #[arg(long, env = "EBPF_OBJECT", default_value = DEFAULT_EBPF_OBJECT)]
    pub ebpf_object: PathBuf,

    /// 规则文件
    #[arg(long, env = "RULES_FILE", default_value = "watchdog-rules.json")]
    pub rules_file: PathBuf,

    /// 每个满载核心的功耗估计（瓦）
    #[arg(long, env = "WATTS_PER_CORE", default_value_t = 15.0)]
    pub watts_per_core: f64,

    /// 对账时同时全量刷新线程、模块、句柄和内存区域
    #[arg(long, env = "REFRESH_RESOURCES")]
    pub refresh_resources: bool,
}

impl CommandArgs {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl From<&CommandArgs> for WatchdogConfig {
    fn from(args: &CommandArgs) -> Self {
        Self {
            eval_interval: Duration::from_millis(args.eval_interval_ms.max(1)),
            reconcile_interval: Duration::from_secs(args.reconcile_interval_secs.max(1)),
            poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
            event_source: args.event_source,
            ebpf_object: args.ebpf_object.clone(),
            rules_file: args.rules_file.clone(),
            watts_per_core: args.watts_per_core,
            refresh_resources: args.refresh_resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CommandArgs::parse_from(["process-watchdog"]);
        assert_eq!(args.bind_address(), "0.0.0.0:9999");

        let config = WatchdogConfig::from(&args);
        assert_eq!(config.event_source, SourceMode::Auto);
        assert_eq!(config.eval_interval, Duration::from_secs(1));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert!(!config.refresh_resources);
    }

    #[test]
    fn test_flags() {
        let args = CommandArgs::parse_from([
            "process-watchdog",
            "--event-source",
            "polling",
            "--eval-interval-ms",
            "250",
            "--rules-file",
            "/etc/watchdog/rules.json",
            "--refresh-resources",
        ]);
        let config = WatchdogConfig::from(&args);
        assert_eq!(config.event_source, SourceMode::Polling);
        assert_eq!(config.eval_interval, Duration::from_millis(250));
        assert_eq!(config.rules_file, PathBuf::from("/etc/watchdog/rules.json"));
        assert!(config.refresh_resources);
    }
}
