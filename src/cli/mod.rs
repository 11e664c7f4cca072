pub mod commands;
pub mod config;
pub mod template;

use clap::{Parser, Subcommand};

pub use commands::execute_command;

#[derive(Parser, Debug)]
#[command(name = "bw-tunnel")]
#[command(author, version, about = "Bandwidth-limited TCP tunnels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 按配置文件运行所有隧道
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnels.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置文件
    Template {
        /// 输出文件路径，缺省输出到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["bw-tunnel", "run", "-c", "my.toml", "-l", "debug"]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Run { ref config } if config == "my.toml"));
    }

    #[test]
    fn test_parse_check_defaults() {
        let cli = Cli::parse_from(["bw-tunnel", "check", "-c", "a.toml"]);
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Check { config, format } => {
                assert_eq!(config, "a.toml");
                assert_eq!(format, "text");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_reject_unknown_format() {
        assert!(Cli::try_parse_from(["bw-tunnel", "check", "-c", "a", "--format", "xml"]).is_err());
    }
}
