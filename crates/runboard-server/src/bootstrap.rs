//! Startup directory layout.

use std::path::Path;
use tracing::info;

use crate::config::ServerConfig;

const DEMO_GROUP: &str = "project-a";

const DEMO_BUILD: &str = r#"#!/bin/bash
# build.sh for project-a
echo "Building project-a..."
for i in {1..10}; do
  echo "Build step $i/10"
  sleep 1
done
echo "Project-a build complete!"
"#;

const DEMO_DEV: &str = r#"#!/bin/bash
# dev.sh for project-a
echo "Starting dev server for project-a..."
echo "Base URL from dashboard: $BASE_URL"
count=0
while true; do
  echo "Dev server running... ($count)"
  count=$((count+1))
  sleep 2
done
"#;

/// Create the scripts, logs and workspace directories.
///
/// A scripts directory created here is seeded with a small demo group so a
/// fresh install has something to run.
pub fn prepare_directories(config: &ServerConfig) -> std::io::Result<()> {
    if !config.scripts_dir.exists() {
        std::fs::create_dir_all(&config.scripts_dir)?;
        seed_demo_scripts(&config.scripts_dir)?;
        info!(path = %config.scripts_dir.display(), "created scripts directory with demo scripts");
    }
    std::fs::create_dir_all(&config.logs_dir)?;
    std::fs::create_dir_all(&config.workspace)?;
    Ok(())
}

fn seed_demo_scripts(scripts_dir: &Path) -> std::io::Result<()> {
    let group = scripts_dir.join(DEMO_GROUP);
    std::fs::create_dir_all(&group)?;
    write_executable(&group.join("build.sh"), DEMO_BUILD)?;
    write_executable(&group.join("dev.sh"), DEMO_DEV)?;
    Ok(())
}

fn write_executable(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, ServerConfig};

    fn config_in(root: &Path) -> ServerConfig {
        let dir = |name: &str| Some(root.join(name).to_string_lossy().into_owned());
        let overrides = ConfigOverrides {
            scripts_dir: dir("scripts"),
            logs_dir: dir("logs"),
            workspace: dir("workspace"),
            ..Default::default()
        };
        ServerConfig::load(None, &overrides).unwrap()
    }

    #[test]
    fn fresh_install_gets_demo_scripts() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        prepare_directories(&config).unwrap();

        assert!(config.logs_dir.is_dir());
        assert!(config.workspace.is_dir());
        let build = config.scripts_dir.join("project-a/build.sh");
        assert!(std::fs::read_to_string(&build).unwrap().contains("Build step"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&build).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn existing_scripts_directory_is_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        std::fs::create_dir_all(&config.scripts_dir).unwrap();
        prepare_directories(&config).unwrap();
        assert!(!config.scripts_dir.join(DEMO_GROUP).exists());
    }
}
