// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub const DEFAULT_MAX_CONN_NUM: usize = 100;
pub const DEFAULT_PENDING_WRITE_NUM: usize = 100;
pub const DEFAULT_LEN_MSG_LEN: usize = 2;
pub const DEFAULT_MIN_MSG_LEN: u32 = 1;
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// 0 means one worker thread per cpu
    pub worker_threads: usize,
}

impl GeneralConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            dir: "logs".to_string(),
            file_prefix: "hearth.log".to_string(),
        }
    }
}

/// Connection server settings, including the wire framing parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    /// width of the length prefix in bytes: 1, 2 or 4
    pub len_msg_len: usize,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    pub little_endian: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            addr: "127.0.0.1:3563".to_string(),
            max_conn_num: DEFAULT_MAX_CONN_NUM,
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            len_msg_len: DEFAULT_LEN_MSG_LEN,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            little_endian: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RpcConfig {
    /// capacity of a server's request queue
    pub chan_call_len: usize,
    /// capacity of a client's async result queue
    pub async_ret_len: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            chan_call_len: 10000,
            async_ret_len: 10000,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub log: LogConfig,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
}

impl AppConfig {
    /// Loads the config file at `path`, then applies `HEARTH_<SECTION>__<KEY>`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidConfig(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("HEARTH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> AppResult<()> {
        if !matches!(self.network.len_msg_len, 1 | 2 | 4) {
            return Err(AppError::InvalidConfig(format!(
                "network.len_msg_len must be 1, 2 or 4, got {}",
                self.network.len_msg_len
            )));
        }
        if self.network.max_msg_len != 0 && self.network.min_msg_len > self.network.max_msg_len
        {
            return Err(AppError::InvalidConfig(format!(
                "network.min_msg_len {} exceeds network.max_msg_len {}",
                self.network.min_msg_len, self.network.max_msg_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_conf(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_keys_take_defaults() {
        let file = write_conf(
            r#"
[network]
addr = "0.0.0.0:9000"
max_conn_num = 8
"#,
        );
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.network.addr, "0.0.0.0:9000");
        assert_eq!(config.network.max_conn_num, 8);
        assert_eq!(config.network.pending_write_num, DEFAULT_PENDING_WRITE_NUM);
        assert_eq!(config.network.len_msg_len, 2);
        assert_eq!(config.network.max_msg_len, 4096);
        assert!(!config.network.little_endian);
        assert_eq!(config.rpc.chan_call_len, 10000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn rejects_bad_length_width() {
        let file = write_conf(
            r#"
[network]
len_msg_len = 3
"#,
        );
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = AppConfig::load("/nonexistent/hearth.toml").unwrap_err();
        assert!(matches!(err, AppError::ConfigFileError(_)));
    }

    #[test]
    fn worker_threads_zero_means_cpu_count() {
        let general = GeneralConfig { worker_threads: 0 };
        assert_eq!(general.worker_threads(), num_cpus::get());
        let general = GeneralConfig { worker_threads: 3 };
        assert_eq!(general.worker_threads(), 3);
    }
}
