//! Shared helpers: fake engines are `/bin/sh -c` scripts.

#![allow(dead_code)]

use cpt_driver::model::{EngineConfig, SyncPolicy};
use std::time::Duration;

pub fn sh_engine(script: &str) -> EngineConfig {
    let mut cfg = EngineConfig::new("/bin/sh");
    cfg.args = vec!["-c".into(), script.into()];
    cfg
}

/// Tighter timing so tests finish quickly.
pub fn fast_policy(deadline: Duration) -> SyncPolicy {
    SyncPolicy {
        poll_interval: Duration::from_millis(25),
        stability_window: Duration::from_millis(75),
        deadline,
        allow_empty: false,
    }
}

/// Reads commands forever and writes `<path>.txt` for every absolute output
/// path it is given. Input archives (`original_*`) are only read.
pub const WRITING_ENGINE: &str = r#"
while IFS= read -r line; do
  echo "cpt> $line"
  case "$line" in
    /*)
      case "$(basename "$line")" in
        original_*) test -f "$line" || { echo "missing input $line" >&2; exit 4; } ;;
        *) printf '0.12 0.34 0.56\n' > "$line.txt" ;;
      esac
      ;;
  esac
done
"#;
