//! Common infrastructure for the VTP driver
//!
//! * logging setup
//! * settings (toml), including the environment overrides
//! * thread control for the background status sender

pub mod settings;
pub mod thread_control;

pub use settings::VtpSettings;
pub use thread_control::ThreadControl;

use std::env;
use std::io::Write;
use std::path::PathBuf;

use colored::{Colorize, ColoredString};
use log::Level;

use vtp_dataclasses::errors::VtpError;

#[macro_use] extern crate log;
extern crate env_logger;

/// Points to the directory where the settings are searched for
pub const CONFIG_DIR_ENV       : &str = "VTP_CONFIG_DIR";
/// Override the destination host of the status sender
pub const STATUS_HOST_ENV      : &str = "VTP_STATUS_HOST";
/// Override the destination port of the status sender
pub const STATUS_PORT_ENV      : &str = "VTP_STATUS_PORT";
/// Name of the settings file within the config directory
pub const DEFAULT_SETTINGS_FILE : &str = "vtp-config.toml";
/// Used when VTP_CONFIG_DIR is not set
pub const DEFAULT_CONFIG_DIR   : &str = "/etc/vtp";

/// Make sure that the loglevel is in color, even though not using pretty_env logger
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that the lines and module paths
/// are printed in the logging output
pub fn init_env_logger() {
  env_logger::builder()
    .format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}

/// The config-search-root, either from
/// VTP_CONFIG_DIR or the default location
pub fn config_search_root() -> PathBuf {
  match env::var(CONFIG_DIR_ENV) {
    Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
    _ => PathBuf::from(DEFAULT_CONFIG_DIR),
  }
}

/// Find the settings file.
///
/// An explicitly given path wins, otherwise
/// the file is looked up in the config-search-root.
/// Returns None if nothing exists on disk, in which
/// case the caller goes with the defaults.
pub fn find_settings_file(explicit : Option<PathBuf>) -> Option<PathBuf> {
  if let Some(path) = explicit {
    if path.exists() {
      return Some(path);
    }
    warn!("Settings file {} does not exist!", path.display());
    return None;
  }
  let candidate = config_search_root().join(DEFAULT_SETTINGS_FILE);
  if candidate.exists() {
    debug!("Found settings at {}", candidate.display());
    Some(candidate)
  } else {
    None
  }
}

/// Load the settings, falling back to the defaults
/// only if there is no file at all. Environment
/// overrides are applied in any case.
///
/// A file which exists but can not be decoded, or
/// an explicitly given file which does not exist,
/// is a ConfigError.
pub fn load_settings(explicit : Option<PathBuf>) -> Result<VtpSettings, VtpError> {
  if let Some(path) = explicit.as_ref() {
    if !path.exists() {
      return Err(VtpError::ConfigError(format!("Settings file {} does not exist", path.display())));
    }
  }
  let mut settings = match find_settings_file(explicit) {
    None => {
      info!("No settings file found, using defaults!");
      VtpSettings::new()
    }
    Some(path) => {
      match VtpSettings::from_toml(&path) {
        Err(err) => {
          error!("Unable to load settings from {}! {err}", path.display());
          return Err(VtpError::ConfigError(format!("Malformed settings file {}: {err}", path.display())));
        }
        Ok(s) => {
          info!("Loaded settings from {}", path.display());
          s
        }
      }
    }
  };
  settings.apply_env_overrides();
  Ok(settings)
}
