//! Project skeletons a workspace starts from.
//!
//! Each template is a small set of files rendered with Tera so that the
//! allocated ports are baked into scripts and config before the agent sees
//! the project.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::WorkspaceError;

use super::ports::PortPair;

/// Named project skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Vite front end with a dev server on the dev port.
    Ui,
    /// Node HTTP service on the service port.
    Server,
    /// Plain HTML, no build step.
    Static,
    /// Empty directory.
    #[default]
    Empty,
}

impl TemplateKind {
    /// Command that installs the template's dependencies, if it has any.
    pub fn install_command(&self) -> Option<&'static str> {
        match self {
            TemplateKind::Ui | TemplateKind::Server => Some("npm install"),
            TemplateKind::Static | TemplateKind::Empty => None,
        }
    }

    /// Command that starts the template's dev server, if it has one.
    pub fn dev_command(&self) -> Option<&'static str> {
        match self {
            TemplateKind::Ui | TemplateKind::Server => Some("npm run dev"),
            TemplateKind::Static | TemplateKind::Empty => None,
        }
    }

    fn files(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            TemplateKind::Ui => UI_FILES,
            TemplateKind::Server => SERVER_FILES,
            TemplateKind::Static => STATIC_FILES,
            TemplateKind::Empty => &[],
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKind::Ui => write!(f, "ui"),
            TemplateKind::Server => write!(f, "server"),
            TemplateKind::Static => write!(f, "static"),
            TemplateKind::Empty => write!(f, "empty"),
        }
    }
}

impl std::str::FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ui" => Ok(TemplateKind::Ui),
            "server" => Ok(TemplateKind::Server),
            "static" => Ok(TemplateKind::Static),
            "empty" => Ok(TemplateKind::Empty),
            other => Err(format!("Unknown template: {}", other)),
        }
    }
}

/// Writes the skeleton for `kind` into `dir` and returns the files written.
pub fn render_template(
    kind: TemplateKind,
    dir: &Path,
    project_name: &str,
    ports: PortPair,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut context = Context::new();
    context.insert("project_name", project_name);
    context.insert("service_port", &ports.service);
    context.insert("dev_port", &ports.dev);

    let mut written = Vec::new();
    for (relative, source) in kind.files() {
        let rendered =
            Tera::one_off(source, &context, false).map_err(|e| WorkspaceError::Template {
                file: relative.to_string(),
                reason: e.to_string(),
            })?;
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, rendered)?;
        written.push(path);
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Skeleton sources
// ---------------------------------------------------------------------------

const UI_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "{{ project_name }}",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite --host 127.0.0.1 --port {{ dev_port }} --strictPort",
    "build": "vite build"
  },
  "devDependencies": {
    "vite": "^5.4.0"
  }
}
"#,
    ),
    (
        "index.html",
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>{{ project_name }}</title>
  </head>
  <body>
    <div id="app"></div>
    <script type="module" src="/src/main.js"></script>
  </body>
</html>
"#,
    ),
    (
        "src/main.js",
        r#"const app = document.querySelector('#app');
app.textContent = 'Service API: http://127.0.0.1:{{ service_port }}';
"#,
    ),
];

const SERVER_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "{{ project_name }}",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "start": "node server.js",
    "dev": "node server.js"
  }
}
"#,
    ),
    (
        "server.js",
        r#"import http from 'node:http';

const port = Number(process.env.PORT || {{ service_port }});

const server = http.createServer((req, res) => {
  if (req.url === '/health') {
    res.writeHead(200, { 'Content-Type': 'application/json' });
    res.end(JSON.stringify({ status: 'ok' }));
    return;
  }
  res.writeHead(404);
  res.end();
});

server.listen(port, '127.0.0.1', () => {
  console.log(`listening on ${port}`);
});
"#,
    ),
];

const STATIC_FILES: &[(&str, &str)] = &[(
    "index.html",
    r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>{{ project_name }}</title>
  </head>
  <body></body>
</html>
"#,
)];
