//! Project type detection and launch planning.

use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};

/// Kind of project found in a generated directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Vite,
    React,
    Vue,
    Angular,
    Next,
    Express,
    Node,
    Flask,
    FastApi,
    Django,
    Streamlit,
    Python,
    Php,
    Static,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Vite => "vite",
            ProjectType::React => "react",
            ProjectType::Vue => "vue",
            ProjectType::Angular => "angular",
            ProjectType::Next => "next",
            ProjectType::Express => "express",
            ProjectType::Node => "node",
            ProjectType::Flask => "flask",
            ProjectType::FastApi => "fast_api",
            ProjectType::Django => "django",
            ProjectType::Streamlit => "streamlit",
            ProjectType::Python => "python",
            ProjectType::Php => "php",
            ProjectType::Static => "static",
        }
    }
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How to tell that dependencies are already installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum InstallCheck {
    /// Installed once this path exists (e.g. `node_modules`)
    Path(PathBuf),
    /// Installed once the supervisor has written this stamp file
    Stamp(PathBuf),
}

impl InstallCheck {
    pub fn path(&self) -> &Path {
        match self {
            InstallCheck::Path(p) | InstallCheck::Stamp(p) => p,
        }
    }
}

/// Everything needed to install and run a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPlan {
    pub project_type: ProjectType,
    pub install_command: Option<String>,
    pub install_check: Option<InstallCheck>,
    pub run_command: String,
    /// Port assumed when no URL shows up in the output
    pub default_port: u16,
}

impl LaunchPlan {
    pub fn new(project_type: ProjectType, run_command: impl Into<String>, default_port: u16) -> Self {
        Self {
            project_type,
            install_command: None,
            install_check: None,
            run_command: run_command.into(),
            default_port,
        }
    }

    pub fn with_install(mut self, command: impl Into<String>, check: InstallCheck) -> Self {
        self.install_command = Some(command.into());
        self.install_check = Some(check);
        self
    }

    /// Whether the install step has to run in `project_dir`.
    pub fn needs_install(&self, project_dir: &Path) -> bool {
        match (&self.install_command, &self.install_check) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(check)) => !project_dir.join(check.path()).exists(),
        }
    }

    pub fn fallback_url(&self) -> String {
        format!("http://localhost:{}", self.default_port)
    }
}

/// Works out how to launch a project directory.
#[cfg_attr(test, mockall::automock)]
pub trait ProjectTypeDetector: Send + Sync {
    fn detect(&self, project_dir: &Path) -> RunnerResult<LaunchPlan>;
}

/// Stamp written after a successful Python install.
pub const PYTHON_INSTALL_STAMP: &str = ".loom-deps-installed";

const PYTHON_ENTRYPOINTS: &[&str] = &["app.py", "main.py", "server.py", "run.py"];
const NODE_ENTRYPOINTS: &[&str] = &["server.js", "app.js", "index.js", "main.js"];

/// Detector that inspects marker files on disk.
#[derive(Debug, Clone)]
pub struct FileSystemDetector {
    port_start: u16,
    port_attempts: u16,
}

impl Default for FileSystemDetector {
    fn default() -> Self {
        Self::new(3000, 100)
    }
}

impl FileSystemDetector {
    pub fn new(port_start: u16, port_attempts: u16) -> Self {
        Self {
            port_start,
            port_attempts,
        }
    }

    fn free_port(&self) -> u16 {
        find_free_port(self.port_start, self.port_attempts).unwrap_or(self.port_start)
    }

    fn detect_node(&self, dir: &Path) -> RunnerResult<LaunchPlan> {
        let content = std::fs::read_to_string(dir.join("package.json"))?;
        let manifest: serde_json::Value = serde_json::from_str(&content).unwrap_or_default();

        let has_dep = |name: &str| {
            ["dependencies", "devDependencies"]
                .iter()
                .any(|section| manifest.get(section).and_then(|d| d.get(name)).is_some())
        };
        let has_script = |name: &str| {
            manifest
                .get("scripts")
                .and_then(|s| s.get(name))
                .is_some()
        };

        let (project_type, default_port) = if has_dep("next") {
            (ProjectType::Next, 3000)
        } else if has_dep("@angular/core") {
            (ProjectType::Angular, 4200)
        } else if has_dep("vite") {
            (ProjectType::Vite, 5173)
        } else if has_dep("react-scripts") || has_dep("react") {
            (ProjectType::React, 3000)
        } else if has_dep("vue") {
            (ProjectType::Vue, 8080)
        } else if has_dep("express") {
            (ProjectType::Express, 3000)
        } else {
            (ProjectType::Node, 3000)
        };

        let run_command = if has_script("start") {
            "npm start".to_string()
        } else if has_script("dev") {
            "npm run dev".to_string()
        } else if has_script("serve") {
            "npm run serve".to_string()
        } else if let Some(entry) = first_existing(dir, NODE_ENTRYPOINTS) {
            format!("node {}", entry)
        } else {
            "npm start".to_string()
        };

        Ok(LaunchPlan::new(project_type, run_command, default_port).with_install(
            "npm install",
            InstallCheck::Path(PathBuf::from("node_modules")),
        ))
    }

    fn detect_python(&self, dir: &Path) -> Option<LaunchPlan> {
        let requirements = std::fs::read_to_string(dir.join("requirements.txt"))
            .unwrap_or_default()
            .to_lowercase();
        let entry = first_existing(dir, PYTHON_ENTRYPOINTS);
        let manage = dir.join("manage.py").exists();
        if requirements.is_empty() && entry.is_none() && !manage {
            return None;
        }

        let plan = if requirements.contains("django") && manage {
            LaunchPlan::new(
                ProjectType::Django,
                "python3 -u manage.py runserver 0.0.0.0:8000",
                8000,
            )
        } else if requirements.contains("streamlit") {
            let script = entry.unwrap_or("app.py");
            LaunchPlan::new(
                ProjectType::Streamlit,
                format!(
                    "python3 -m streamlit run {} --server.port 8501 --server.headless true",
                    script
                ),
                8501,
            )
        } else if requirements.contains("fastapi") || requirements.contains("uvicorn") {
            let module = entry.unwrap_or("main.py").trim_end_matches(".py");
            LaunchPlan::new(
                ProjectType::FastApi,
                format!(
                    "python3 -m uvicorn {}:app --host 0.0.0.0 --port 8000",
                    module
                ),
                8000,
            )
        } else if let Some(script) = entry {
            let project_type = if requirements.contains("flask") {
                ProjectType::Flask
            } else {
                ProjectType::Python
            };
            LaunchPlan::new(project_type, format!("python3 -u {}", script), 5000)
        } else {
            return None;
        };

        Some(if dir.join("requirements.txt").exists() {
            plan.with_install(
                "python3 -m pip install -r requirements.txt",
                InstallCheck::Stamp(PathBuf::from(PYTHON_INSTALL_STAMP)),
            )
        } else {
            plan
        })
    }

    fn detect_static(&self, dir: &Path) -> Option<LaunchPlan> {
        let root = if dir.join("index.html").exists() {
            "."
        } else if dir.join("public/index.html").exists() {
            "public"
        } else {
            return None;
        };
        let port = self.free_port();
        Some(LaunchPlan::new(
            ProjectType::Static,
            format!(
                "python3 -u -m http.server {} --bind 127.0.0.1 --directory {}",
                port, root
            ),
            port,
        ))
    }
}

impl ProjectTypeDetector for FileSystemDetector {
    fn detect(&self, project_dir: &Path) -> RunnerResult<LaunchPlan> {
        if !project_dir.is_dir() {
            return Err(RunnerError::ProjectNotFound(
                project_dir.display().to_string(),
            ));
        }

        let plan = if project_dir.join("package.json").exists() {
            Some(self.detect_node(project_dir)?)
        } else if let Some(plan) = self.detect_python(project_dir) {
            Some(plan)
        } else if project_dir.join("index.php").exists()
            || project_dir.join("composer.json").exists()
        {
            let port = find_free_port(8000, self.port_attempts).unwrap_or(8000);
            Some(LaunchPlan::new(
                ProjectType::Php,
                format!("php -S 0.0.0.0:{} -t .", port),
                port,
            ))
        } else {
            self.detect_static(project_dir)
        };

        let plan = plan.ok_or_else(|| {
            RunnerError::Detection(format!(
                "no package.json, Python entry point or index.html in {}",
                project_dir.display()
            ))
        })?;
        debug!(
            "Detected {} project in {}: {}",
            plan.project_type,
            project_dir.display(),
            plan.run_command
        );
        Ok(plan)
    }
}

fn first_existing(dir: &Path, candidates: &[&'static str]) -> Option<&'static str> {
    candidates.iter().copied().find(|c| dir.join(c).is_file())
}

/// First port at or above `start` that can be bound on the loopback interface.
pub fn find_free_port(start: u16, attempts: u16) -> Option<u16> {
    (0..attempts)
        .filter_map(|offset| start.checked_add(offset))
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_vite_project() {
        let dir = project(&[(
            "package.json",
            r#"{"scripts": {"dev": "vite"}, "devDependencies": {"vite": "^5.0.0"}}"#,
        )]);
        let plan = FileSystemDetector::default().detect(dir.path()).unwrap();
        assert_eq!(plan.project_type, ProjectType::Vite);
        assert_eq!(plan.run_command, "npm run dev");
        assert_eq!(plan.default_port, 5173);
        assert!(plan.needs_install(dir.path()));

        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        assert!(!plan.needs_install(dir.path()));
    }

    #[test]
    fn test_express_without_scripts_uses_entrypoint() {
        let dir = project(&[
            ("package.json", r#"{"dependencies": {"express": "^4"}}"#),
            ("server.js", "require('express')"),
        ]);
        let plan = FileSystemDetector::default().detect(dir.path()).unwrap();
        assert_eq!(plan.project_type, ProjectType::Express);
        assert_eq!(plan.run_command, "node server.js");
    }

    #[test]
    fn test_flask_project() {
        let dir = project(&[
            ("requirements.txt", "Flask==3.0\n"),
            ("app.py", "from flask import Flask"),
        ]);
        let plan = FileSystemDetector::default().detect(dir.path()).unwrap();
        assert_eq!(plan.project_type, ProjectType::Flask);
        assert_eq!(plan.run_command, "python3 -u app.py");
        assert_eq!(
            plan.install_check,
            Some(InstallCheck::Stamp(PathBuf::from(PYTHON_INSTALL_STAMP)))
        );
    }

    #[test]
    fn test_fastapi_module_name() {
        let dir = project(&[
            ("requirements.txt", "fastapi\nuvicorn\n"),
            ("main.py", "app = FastAPI()"),
        ]);
        let plan = FileSystemDetector::default().detect(dir.path()).unwrap();
        assert_eq!(plan.project_type, ProjectType::FastApi);
        assert!(plan.run_command.contains("uvicorn main:app"));
    }

    #[test]
    fn test_static_site_gets_free_port() {
        let dir = project(&[("index.html", "<html></html>")]);
        let plan = FileSystemDetector::new(3000, 100)
            .detect(dir.path())
            .unwrap();
        assert_eq!(plan.project_type, ProjectType::Static);
        assert!(plan.default_port >= 3000);
        assert!(plan.run_command.contains(&plan.default_port.to_string()));
        assert!(!plan.needs_install(dir.path()));
    }

    #[test]
    fn test_unrecognised_directory() {
        let dir = project(&[("notes.txt", "hello")]);
        let err = FileSystemDetector::default().detect(dir.path()).unwrap_err();
        assert!(matches!(err, RunnerError::Detection(_)));
    }

    #[test]
    fn test_missing_directory() {
        let err = FileSystemDetector::default()
            .detect(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, RunnerError::ProjectNotFound(_)));
    }

    #[test]
    fn test_find_free_port_skips_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        if let Some(port) = find_free_port(taken, 5) {
            assert_ne!(port, taken);
        }
    }
}
