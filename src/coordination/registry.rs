use std::path::PathBuf;

pub const COURSEBOOK: &str = "coursebook";
pub const GRADES: &str = "grades";
pub const RMP_PROFILES: &str = "rmp-profiles";

/// Job that consumes the gathered inputs and writes the integration results
pub const TRANSFORM_JOB: &str = "integration";

/// Result categories written by the transform, each published under its own prefix
pub const RECORDS: &str = "records";
pub const DERIVED: &str = "derived";
pub const RESULT_CATEGORIES: [&str; 2] = [RECORDS, DERIVED];

/// Directory conventions under the project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job: &str) -> PathBuf {
        self.root.join("scripts").join(job)
    }

    pub fn entry_point(&self, job: &str) -> PathBuf {
        self.job_dir(job).join("main.py")
    }

    pub fn local_output_dir(&self, source: &str) -> PathBuf {
        self.job_dir(source).join("out")
    }

    pub fn shared_input_root(&self) -> PathBuf {
        self.job_dir(TRANSFORM_JOB).join("in")
    }

    pub fn shared_input_dir(&self, source: &str) -> PathBuf {
        self.shared_input_root().join(source)
    }

    pub fn result_dir(&self, category: &str) -> PathBuf {
        self.job_dir(TRANSFORM_JOB).join("out").join(category)
    }

    /// Project-local virtualenv interpreter, preferred over the configured one
    pub fn venv_interpreter(&self) -> PathBuf {
        self.root.join("venv").join("bin").join("python")
    }
}

/// One registered data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceJob {
    pub name: String,
    pub local_output_dir: PathBuf,
    pub shared_input_dir: PathBuf,
}

impl SourceJob {
    pub fn new(layout: &Layout, name: &str) -> Self {
        Self {
            name: name.to_string(),
            local_output_dir: layout.local_output_dir(name),
            shared_input_dir: layout.shared_input_dir(name),
        }
    }
}

/// The fixed set of sources a run works with
#[derive(Debug, Clone)]
pub struct Registry {
    sources: Vec<SourceJob>,
    refresh_order: Vec<String>,
    term_scoped: Vec<String>,
}

impl Registry {
    /// Production sources
    ///
    /// Refresh runs grades first and coursebook last; coursebook and grades
    /// hold per-term data whose prior output is preserved before refreshing.
    pub fn standard(layout: &Layout) -> Self {
        Self::new(layout, &[COURSEBOOK, GRADES, RMP_PROFILES])
            .with_refresh_order(&[GRADES, RMP_PROFILES, COURSEBOOK])
            .with_term_scoped(&[COURSEBOOK, GRADES])
    }

    /// Registry of arbitrary sources, refreshed in declaration order
    pub fn new(layout: &Layout, names: &[&str]) -> Self {
        Self {
            sources: names.iter().map(|n| SourceJob::new(layout, n)).collect(),
            refresh_order: names.iter().map(|n| n.to_string()).collect(),
            term_scoped: Vec::new(),
        }
    }

    /// Names outside the registry are ignored
    pub fn with_refresh_order(mut self, order: &[&str]) -> Self {
        self.refresh_order = self.known(order);
        self
    }

    pub fn with_term_scoped(mut self, names: &[&str]) -> Self {
        self.term_scoped = self.known(names);
        self
    }

    fn known(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.source(n).is_some())
            .map(|n| n.to_string())
            .collect()
    }

    pub fn sources(&self) -> &[SourceJob] {
        &self.sources
    }

    pub fn source(&self, name: &str) -> Option<&SourceJob> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn refresh_order(&self) -> &[String] {
        &self.refresh_order
    }

    pub fn term_scoped(&self) -> Vec<&SourceJob> {
        self.term_scoped
            .iter()
            .filter_map(|name| self.source(name))
            .collect()
    }
}
