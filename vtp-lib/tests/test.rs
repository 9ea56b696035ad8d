use std::path::PathBuf;

use vtp_dataclasses::errors::VtpError;
use vtp_lib::VtpSettings;
use vtp_lib::load_settings;
use vtp_lib::settings::RocMode;

#[test]
fn write_and_read_config_file() {
  let mut settings  = VtpSettings::new();
  settings.roc.mode = RocMode::FullSoftware;
  settings.status.port = 50123;
  let path = std::env::temp_dir().join(format!("vtp-config-test-{}.toml", std::process::id()));
  settings.to_toml(path.to_string_lossy().to_string());
  let read_back = VtpSettings::from_toml(&path).unwrap();
  assert_eq!(read_back.roc.mode, RocMode::FullSoftware);
  assert_eq!(read_back.status.port, 50123);
  assert_eq!(read_back.dma.wait, settings.dma.wait);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn missing_config_file_is_an_error() {
  let path = PathBuf::from("/nonexistent/vtp-config.toml");
  assert!(VtpSettings::from_toml(&path).is_err());
  assert!(vtp_lib::find_settings_file(Some(path)).is_none());
}

#[test]
fn malformed_config_file_is_a_config_error() {
  let path = std::env::temp_dir().join(format!("vtp-config-bad-{}.toml", std::process::id()));
  std::fs::write(&path, "[device\nuio_path = 3\n").unwrap();
  match load_settings(Some(path.clone())) {
    Err(VtpError::ConfigError(_)) => (),
    Err(err) => panic!("Unexpected error {err}"),
    Ok(_)    => panic!("Malformed settings must not be replaced by the defaults!"),
  }
  let _ = std::fs::remove_file(&path);
}

#[test]
fn explicit_settings_file_is_loaded() {
  let mut settings = VtpSettings::new();
  settings.dma.n_buffers = 7;
  let path = std::env::temp_dir().join(format!("vtp-config-good-{}.toml", std::process::id()));
  settings.to_toml(path.to_string_lossy().to_string());
  let loaded = load_settings(Some(path.clone())).unwrap();
  assert_eq!(loaded.dma.n_buffers, 7);
  assert!(matches!(load_settings(Some(PathBuf::from("/nonexistent/vtp.toml"))),
                   Err(VtpError::ConfigError(_))));
  let _ = std::fs::remove_file(&path);
}
