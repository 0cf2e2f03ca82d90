use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{ResolverConfig, read_resolv_conf};

/// Reloads resolv.conf at `path` into `config` whenever the file changes.
pub fn spawn(path: PathBuf, port: u16, config: Arc<ArcSwap<ResolverConfig>>) {
    // notify 的 watcher 需要一直存活，放在独立线程里持有
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, port, config) {
            error!(target = "watcher", error = %err, "resolv.conf watcher exited with error");
        }
    });
}

/// Re-reads `path` and swaps it in. A file that can't be read, or that
/// lists no nameservers, leaves the current config untouched.
pub fn reload(path: &Path, port: u16, config: &ArcSwap<ResolverConfig>) -> anyhow::Result<()> {
    let new_cfg = read_resolv_conf(path, port)?;
    if new_cfg.nameservers.is_empty() {
        anyhow::bail!("no nameservers in {}", path.display());
    }
    if **config.load() != new_cfg {
        config.store(Arc::new(new_cfg));
        info!(target = "watcher", path = %path.display(), "resolv.conf reloaded");
    }
    Ok(())
}

fn run_watcher(path: PathBuf, port: u16, config: Arc<ArcSwap<ResolverConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "resolv.conf watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Editors truncate then write; give the second half a moment to land.
                let mut retries = 3;
                while retries > 0 {
                    match reload(&path, port, &config) {
                        Ok(()) => break,
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %err, "resolv.conf reload failed, keeping old config");
                            } else {
                                thread::sleep(Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
