//! Template bridge (spec §4.9), backed by `minijinja` — a Jinja2-compatible
//! engine preserving the `{{ var }}` substitution syntax the original
//! implementation's Jinja2 templates used (`original_source/pitcrew/template.py`).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use crate::{
    argument::Value,
    context::Context,
    error::{CrewError, Result},
    file_options::FileOptions,
    file_ref::FileRef,
};

static TEMPLATE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// The process-global temporary directory templates are rendered into.
/// Created lazily on first render, removed best-effort at process exit (see
/// [`cleanup`]).
fn template_dir() -> &'static Path {
    TEMPLATE_DIR.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("crewctl-templates-{}", uuid::Uuid::new_v4()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    })
}

/// Best-effort removal of the template temp directory; call once at process
/// exit (wired up by [`crate::app::App`]'s `Drop`).
pub fn cleanup() {
    if let Some(dir) = TEMPLATE_DIR.get() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

/// A template resolved relative to a task's source directory.
pub struct Template {
    path: PathBuf,
}

impl Template {
    /// Resolves `name` relative to `source_dir` (a task's declared source
    /// directory, analogous to `task_file`).
    pub fn resolve(source_dir: impl AsRef<Path>, name: &str) -> Self {
        Self { path: source_dir.as_ref().join(name) }
    }

    async fn render_env(&self, vars: &HashMap<String, Value>) -> Result<(minijinja::Environment<'static>, String)> {
        let source = FileOptions::read_to_string(&self.path).await.map_err(CrewError::from)?;
        let mut env = minijinja::Environment::new();
        env.add_template_owned("main", source.clone())
            .map_err(|e| CrewError::Transport(e.to_string()))?;
        let _ = vars;
        Ok((env, source))
    }

    /// Renders with `vars`, writing the output to a unique path under the
    /// process-global template temp directory and returning a local file
    /// reference to it.
    pub async fn render(&self, local_ctx: &Context, vars: HashMap<String, Value>) -> Result<FileRef> {
        let bytes = self.render_as_bytes(vars).await?;
        let out_path = template_dir().join(uuid::Uuid::new_v4().to_string());
        FileOptions::write_str(&out_path, &String::from_utf8_lossy(&bytes))
            .await
            .map_err(CrewError::from)?;
        Ok(local_ctx.file(out_path))
    }

    /// Renders with `vars`, returning the rendered bytes directly. Rendering
    /// with no variables returns the template bytes unchanged.
    pub async fn render_as_bytes(&self, vars: HashMap<String, Value>) -> Result<Vec<u8>> {
        let (env, _source) = self.render_env(&vars).await?;
        let template = env.get_template("main").map_err(|e| CrewError::Transport(e.to_string()))?;
        let ctx: HashMap<String, serde_json::Value> =
            vars.iter().map(|(k, v)| (k.clone(), v.to_wire_json())).collect();
        let rendered =
            template.render(ctx).map_err(|e| CrewError::Transport(e.to_string()))?;
        Ok(rendered.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn render_with_no_variables_is_unchanged() {
        let dir = std::env::temp_dir().join(format!("crewctl-tpl-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let template_path = dir.join("greeting.txt");
        std::fs::write(&template_path, "hello, static text").unwrap();
        let template = Template::resolve(&dir, "greeting.txt");
        let bytes = template.render_as_bytes(HashMap::new()).await.unwrap();
        assert_eq!(bytes, b"hello, static text");
    }

    #[tokio::test]
    async fn render_substitutes_variables() {
        let dir = std::env::temp_dir().join(format!("crewctl-tpl-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let template_path = dir.join("greeting.txt");
        std::fs::write(&template_path, "hello, {{ name }}").unwrap();
        let template = Template::resolve(&dir, "greeting.txt");
        let mut vars = HashMap::new();
        vars.insert("name".to_owned(), Value::from("world"));
        let bytes = template.render_as_bytes(vars).await.unwrap();
        assert_eq!(bytes, b"hello, world");
    }
}
