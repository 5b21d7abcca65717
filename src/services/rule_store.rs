use log::info;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::models::CatalogConfig;

/// 规则配置的持久化边界
pub trait RuleStore: Send + Sync {
    fn load(&self) -> Result<CatalogConfig, StoreError>;

    fn save(&self, config: &CatalogConfig) -> Result<(), StoreError>;
}

/// JSON 文件存储；写入先落到临时文件再 rename，读者不会看到半个文件
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleStore for JsonRuleStore {
    /// 文件不存在时返回空配置
    fn load(&self) -> Result<CatalogConfig, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Rules file {} not found, starting with an empty catalog", self.path.display());
                Ok(CatalogConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, config: &CatalogConfig) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // 每次写入用独立的临时文件，并发保存互不覆盖
        let json = serde_json::to_vec_pretty(config)?;
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
