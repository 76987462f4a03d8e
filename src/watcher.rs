use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::dispatcher::Dispatcher;
use crate::nft::Connector;
use crate::rules::RuntimeConfig;

const RELOAD_ATTEMPTS: u32 = 3;

pub fn spawn<K: Connector>(path: PathBuf, dispatcher: Dispatcher<K>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, dispatcher) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn load_runtime(path: &Path) -> anyhow::Result<RuntimeConfig> {
    config::load_config(path).and_then(RuntimeConfig::from_config)
}

fn run_watcher<K: Connector>(path: PathBuf, dispatcher: Dispatcher<K>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // 写文件可能是 truncate+write，读到半截时稍后重试
                let mut attempt = 1;
                loop {
                    match load_runtime(&path) {
                        Ok(runtime) => {
                            dispatcher.reload(runtime);
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) if attempt >= RELOAD_ATTEMPTS => {
                            warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                            break;
                        }
                        Err(_) => {
                            attempt += 1;
                            thread::sleep(Duration::from_millis(50));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKernel;
    use crate::nft::Family;

    #[test]
    fn loads_and_compiles_runtime_from_disk() {
        let path = std::env::temp_dir().join(format!("nftdns-watcher-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "rules": [ { "families": ["ip6"], "sets": [ { "table": "t", "set": "s" } ] } ] }"#,
        )
        .expect("write");
        let runtime = load_runtime(&path).expect("load");
        assert_eq!(runtime.targets(Family::Ip6).len(), 1);

        std::fs::write(&path, "{ not json").expect("write");
        assert!(load_runtime(&path).is_err());
        let _ = std::fs::remove_file(&path);

        // reload 路径与 watcher 使用同一个 Dispatcher 接口
        let dispatcher = Dispatcher::new(FakeKernel::new(), RuntimeConfig::default()).expect("dispatcher");
        dispatcher.reload(runtime);
        assert_eq!(dispatcher.runtime().target_count(), 1);
    }
}
