use super::Backend;

/// Outcome of removing several dependencies in one invocation.
#[derive(Debug, Default)]
pub struct RemovalReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl RemovalReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove each dependency in turn. A failure is reported and the rest are
/// still attempted.
pub fn remove_dependencies<B>(backend: &B, names: &[String]) -> RemovalReport
where
    B: Backend + ?Sized,
{
    let mut report = RemovalReport::default();
    for name in names {
        match backend.remove_dependency(name) {
            Ok(()) => {
                println!("✓ Removed {name}");
                report.removed.push(name.clone());
            }
            Err(err) => {
                eprintln!("✗ Failed to remove {name}: {err:#}");
                report.failed.push((name.clone(), err));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::Path;

    use anyhow::{Result, bail};

    use super::*;
    use crate::backend::{
        BackendKind, BenchOptions, BuildOptions, Dependency, PipelinePlan, PlanContext, Target,
        TestOptions, VariantDirs,
    };

    /// Backend whose only working operation is removal.
    struct Manifest {
        deps: RefCell<Vec<String>>,
    }

    impl Backend for Manifest {
        fn kind(&self) -> BackendKind {
            BackendKind::CMake
        }
        fn root(&self) -> &Path {
            Path::new(".")
        }
        fn project_name(&self) -> &str {
            "demo"
        }
        fn build(&self, _: &BuildOptions) -> Result<VariantDirs> {
            unimplemented!()
        }
        fn test(&self, _: &TestOptions) -> Result<()> {
            unimplemented!()
        }
        fn bench(&self, _: &BenchOptions) -> Result<()> {
            unimplemented!()
        }
        fn list_targets(&self) -> Result<Vec<Target>> {
            Ok(Vec::new())
        }
        fn add_dependency(&self, _: &str, _: Option<&str>) -> Result<()> {
            unimplemented!()
        }
        fn remove_dependency(&self, name: &str) -> Result<()> {
            let mut deps = self.deps.borrow_mut();
            let Some(pos) = deps.iter().position(|d| d == name) else {
                bail!("dependency '{name}' is not listed");
            };
            deps.remove(pos);
            Ok(())
        }
        fn list_dependencies(&self) -> Result<Vec<Dependency>> {
            Ok(Vec::new())
        }
        fn search_dependencies(&self, _: &str) -> Result<Vec<Dependency>> {
            Ok(Vec::new())
        }
        fn dependency_info(&self, name: &str) -> Result<Dependency> {
            bail!("no info for {name}")
        }
        fn ci_plan(&self, _: &PlanContext<'_>) -> PipelinePlan {
            PipelinePlan::default()
        }
    }

    #[test]
    fn failure_does_not_stop_later_removals() {
        let backend = Manifest {
            deps: RefCell::new(vec!["fmt".into(), "zlib".into()]),
        };
        let names = vec!["fmt".to_string(), "boost".to_string(), "zlib".to_string()];
        let report = remove_dependencies(&backend, &names);

        assert_eq!(report.removed, vec!["fmt", "zlib"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "boost");
        assert!(!report.is_success());
        assert!(backend.deps.borrow().is_empty());
    }

    #[test]
    fn all_removed_is_success() {
        let backend = Manifest {
            deps: RefCell::new(vec!["fmt".into()]),
        };
        let report = remove_dependencies(&backend, &["fmt".to_string()]);
        assert!(report.is_success());
    }
}
