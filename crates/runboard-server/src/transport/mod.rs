pub mod http;
pub mod websocket;

#[cfg(test)]
pub(crate) mod fixtures {
    use runboard_core::testing::{wait_finished, ScriptedSpawner};
    use runboard_core::{
        LaunchSettings, ScriptCatalog, ScriptIdentity, SessionId, SessionRegistry,
    };
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Arc;

    pub struct Fixture {
        _root: tempfile::TempDir,
        pub spawner: Arc<ScriptedSpawner>,
        pub registry: Arc<SessionRegistry>,
    }

    /// Registry over a temp catalog holding `project-a/build.sh`, with
    /// scripted processes instead of real ones.
    pub fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let scripts = root.path().join("scripts");
        let workspace = root.path().join("workspace");
        let logs = root.path().join("logs");
        fs::create_dir_all(scripts.join("project-a")).unwrap();
        fs::create_dir_all(workspace.join("project-a")).unwrap();
        fs::create_dir_all(&logs).unwrap();
        fs::write(scripts.join("project-a/build.sh"), "echo build").unwrap();

        let spawner = ScriptedSpawner::new();
        let settings = LaunchSettings {
            logs_dir: logs,
            ..LaunchSettings::default()
        };
        let registry = Arc::new(SessionRegistry::new(
            ScriptCatalog::new(scripts, workspace),
            spawner.clone(),
            settings,
        ));
        Fixture {
            _root: root,
            spawner,
            registry,
        }
    }

    impl Fixture {
        pub async fn start_build(&self) -> SessionId {
            self.registry
                .start(ScriptIdentity::new("project-a", "build"), vec![], HashMap::new())
                .await
                .unwrap()
                .id()
        }

        /// A run that printed `output` and exited with code 0.
        pub async fn finished_run(&self, output: &[u8]) -> SessionId {
            let pid = self.start_build().await;
            self.spawner.emit(pid, output);
            self.spawner.exit(pid, 0);
            let session = self.registry.get(pid).await.unwrap();
            wait_finished(&session).await;
            pid
        }
    }
}
