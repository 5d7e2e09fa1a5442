// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::{fs, io, path::Path};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct KilnConfig {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_vsync")]
    pub vsync: bool,
    #[serde(default)]
    pub vsync_mode: VsyncMode,
    /// Lower bound on presentable images; the platform minimum still wins if larger.
    #[serde(default)]
    pub min_image_count: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    #[default]
    Fifo,
    Mailbox,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync: default_vsync(),
            vsync_mode: VsyncMode::Fifo,
            min_image_count: 0,
        }
    }
}

fn default_title() -> String {
    "kiln".to_owned()
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_clear() -> [f32; 4] {
    [0.01, 0.01, 0.01, 1.0]
}
fn default_vsync() -> bool {
    true
}

impl KilnConfig {
    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }
}

/// Missing file means defaults. A file that fails to parse also falls back to
/// defaults, but loudly.
pub fn load_cfg(path: &Path) -> KilnConfig {
    match fs::read_to_string(path) {
        Ok(s) => match KilnConfig::from_toml(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("config {} is malformed ({e}); using defaults", path.display());
                KilnConfig::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => KilnConfig::default(),
        Err(e) => {
            warn!("config {} unreadable ({e}); using defaults", path.display());
            KilnConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let cfg = KilnConfig::from_toml("").unwrap();
        assert_eq!(cfg, KilnConfig::default());
        assert_eq!(cfg.window.width, 800);
        assert_eq!(cfg.window.height, 600);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Fifo);
    }

    #[test]
    fn partial_render_table_keeps_other_defaults() {
        let cfg = KilnConfig::from_toml(
            r#"
[render]
vsync_mode = "mailbox"
min_image_count = 3
"#,
        )
        .unwrap();
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Mailbox);
        assert_eq!(cfg.render.min_image_count, 3);
        assert_eq!(cfg.render.clear_color, default_clear());
        assert_eq!(cfg.window, WindowCfg::default());
    }

    #[test]
    fn unknown_vsync_mode_is_rejected() {
        assert!(KilnConfig::from_toml("[render]\nvsync_mode = \"sometimes\"\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_cfg(Path::new("definitely/not/here/kiln.toml"));
        assert_eq!(cfg, KilnConfig::default());
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = std::env::temp_dir().join(format!("kiln-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kiln.toml");
        fs::write(&path, "[window\nwidth = ").unwrap();
        assert_eq!(load_cfg(&path), KilnConfig::default());

        fs::write(&path, "[window]\ntitle = \"cube\"\nwidth = 1280\n").unwrap();
        let cfg = load_cfg(&path);
        assert_eq!(cfg.window.title, "cube");
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.window.height, 600);
        let _ = fs::remove_dir_all(&dir);
    }
}
