//! エンジン起動設定（TOML）
//!
//! ```toml
//! [primary]
//! command = "/usr/local/bin/katago"
//! args = ["analysis", "-config", "analysis.cfg", "-model", "model.bin.gz"]
//! max_visits = 500
//!
//! [primary.override_settings]
//! rootPolicyTemperature = 1.1
//!
//! [secondary]
//! command = "/usr/local/bin/leelaz"
//! args = ["--gtp", "-w", "network.gz"]
//! visits = 200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// 設定ファイル全体
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub primary: PrimaryEngineConfig,
    pub secondary: Option<SecondaryEngineConfig>,
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AnalysisConfig =
            toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.primary.validate()?;
        if let Some(secondary) = &config.secondary {
            secondary.validate()?;
        }
        Ok(config)
    }
}

/// JSON-lines 解析エンジンの設定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrimaryEngineConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// 1 局面あたりの最大訪問数
    pub max_visits: u32,
    /// `AnalysisOptions::fast` 指定時の訪問数
    pub fast_visits: u32,
    /// 1 クエリあたりの最大思考時間（秒）。未指定なら制限なし
    pub max_time: Option<f64>,
    pub wide_root_noise: f64,
    /// 全クエリに加算する優先度
    pub base_priority: i32,
    /// ponder クエリに加算する優先度（通常は負）
    pub ponder_priority_offset: i32,
    /// 途中経過の報告間隔（秒）。未指定なら最終結果のみ
    pub report_every: Option<f64>,
    pub start_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// `overrideSettings` にそのまま足す追加設定
    pub override_settings: toml::Table,
}

impl Default for PrimaryEngineConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("katago"),
            args: vec!["analysis".to_string()],
            max_visits: 500,
            fast_visits: 25,
            max_time: None,
            wide_root_noise: 0.04,
            base_priority: 0,
            ponder_priority_offset: -100,
            report_every: None,
            start_timeout_ms: 30_000,
            shutdown_timeout_ms: 3_000,
            override_settings: toml::Table::new(),
        }
    }
}

impl PrimaryEngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.as_os_str().is_empty() {
            return Err(EngineError::Config("primary.command is empty".to_string()));
        }
        if self.max_visits == 0 {
            return Err(EngineError::Config("primary.max_visits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// GTP 比較エンジンの設定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecondaryEngineConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// 候補手の訪問数合計がこれに達したら読み取りを打ち切る
    pub visits: u32,
    /// 解析コマンドに渡す報告間隔（センチ秒）
    pub report_interval_cs: u32,
    /// 1 リクエストの壁時計上限
    pub max_wait_ms: u64,
    /// 非強制リクエストの最小間隔
    pub min_interval_ms: u64,
    pub analyze_command: String,
    pub interrupt_command: String,
}

impl Default for SecondaryEngineConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("leelaz"),
            args: vec!["--gtp".to_string()],
            visits: 200,
            report_interval_cs: 10,
            max_wait_ms: 10_000,
            min_interval_ms: 500,
            analyze_command: "lz-analyze".to_string(),
            interrupt_command: "stop".to_string(),
        }
    }
}

impl SecondaryEngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.as_os_str().is_empty() {
            return Err(EngineError::Config("secondary.command is empty".to_string()));
        }
        if self.analyze_command.trim().is_empty() {
            return Err(EngineError::Config("secondary.analyze_command is empty".to_string()));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}
