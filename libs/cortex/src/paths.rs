//! Process-local filesystem layout rooted at the base directory.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BasePaths {
    base: PathBuf,
}

impl BasePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates every directory the bot writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.configs_dir(),
            self.logs_dir(),
            self.cache_dir(),
            self.products_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.base.join("configs")
    }

    pub fn main_cfg(&self) -> PathBuf {
        self.configs_dir().join("_main.cfg")
    }

    pub fn auto_response_cfg(&self) -> PathBuf {
        self.configs_dir().join("auto_response.cfg")
    }

    pub fn auto_delivery_cfg(&self) -> PathBuf {
        self.configs_dir().join("auto_delivery.cfg")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("storage").join("cache")
    }

    pub fn products_dir(&self) -> PathBuf {
        self.base.join("storage").join("products")
    }

    pub fn product_file(&self, name: &str) -> PathBuf {
        self.products_dir().join(name)
    }

    pub fn process_lock(&self) -> PathBuf {
        self.cache_dir().join("process.lock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.cache_dir().join("pid.txt")
    }

    pub fn blacklist(&self) -> PathBuf {
        self.cache_dir().join("blacklist.json")
    }

    pub fn old_users(&self) -> PathBuf {
        self.cache_dir().join("old_users.json")
    }

    pub fn proxy_dict(&self) -> PathBuf {
        self.cache_dir().join("proxy_dict.json")
    }

    pub fn withdrawal_forecast(&self) -> PathBuf {
        self.cache_dir().join("withdrawal_forecast.json")
    }

    pub fn answer_templates(&self) -> PathBuf {
        self.cache_dir().join("answer_templates.json")
    }

    pub fn authorized_users(&self) -> PathBuf {
        self.cache_dir().join("tg_authorized_users.json")
    }

    pub fn backup_zip(&self) -> PathBuf {
        self.base.join("backup.zip")
    }
}
