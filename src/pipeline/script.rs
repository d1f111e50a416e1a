//! Bash rendering of a [`PipelinePlan`] for container and ssh runs.
//!
//! The script is produced from a fixed template with named `{{placeholders}}`.
//! Every dynamic value is shell-quoted before substitution. A failing step
//! exits with its phase's code (see [`Phase::exit_code`]) so the host can tell
//! which phase failed.

use std::collections::HashSet;

use thiserror::Error;

use crate::backend::artifacts;
use crate::backend::{PipelinePlan, PlanContext, Step, StepAction};
use crate::error::Phase;

const TEMPLATE: &str = r#"#!/usr/bin/env bash
set -eo pipefail
phase_code=0
trap 'rc=$?; if [ "$rc" -ne 0 ] && [ "$phase_code" -ne 0 ]; then exit "$phase_code"; fi' EXIT

run_quiet() {
  local log
  log="$(mktemp)"
  if ! "$@" >"$log" 2>&1; then
    cat "$log" >&2
    rm -f "$log"
    return 1
  fi
  rm -f "$log"
}

{{exports}}
cd {{source_dir}}
mkdir -p {{build_dir}} {{output_dir}}

{{steps}}
"#;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("template placeholder '{0}' has no value")]
    MissingValue(String),

    #[error("value '{0}' does not match any template placeholder")]
    UnusedValue(String),

    #[error("unterminated placeholder in template")]
    Unterminated,

    #[error("invalid environment variable name '{0}'")]
    InvalidEnvKey(String),
}

/// Substitute `{{name}}` placeholders. Every placeholder needs a value and
/// every value must be used.
pub fn render_template(template: &str, values: &[(&str, String)]) -> Result<String, ScriptError> {
    let mut out = String::with_capacity(template.len());
    let mut used = HashSet::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(ScriptError::Unterminated)?;
        let name = after[..end].trim();
        let (key, value) = values
            .iter()
            .find(|(key, _)| *key == name)
            .ok_or_else(|| ScriptError::MissingValue(name.to_string()))?;
        used.insert(*key);
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if let Some((unused, _)) = values.iter().find(|(key, _)| !used.contains(key)) {
        return Err(ScriptError::UnusedValue(unused.to_string()));
    }
    Ok(out)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

fn exports(plan: &PipelinePlan, ctx: &PlanContext<'_>) -> Result<String, ScriptError> {
    plan.environment(ctx.toolchain)
        .iter()
        .map(|(key, value)| {
            if is_valid_env_key(key) {
                Ok(format!("export {key}={}", quote(value)))
            } else {
                Err(ScriptError::InvalidEnvKey(key.clone()))
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|lines| lines.join("\n"))
}

/// Tool output is only shown on failure unless verbose. Test, bench and run
/// output always streams, the same as on the host.
fn is_quiet(step: &Step, verbose: bool) -> bool {
    !verbose && !matches!(step.phase, Phase::Test | Phase::Bench | Phase::Run)
}

fn render_step(step: &Step, verbose: bool) -> String {
    let mut body = match &step.action {
        StepAction::Exec { program, args } => {
            let command = shell_words::join(std::iter::once(program).chain(args));
            if is_quiet(step, verbose) {
                format!("run_quiet {command}")
            } else {
                command
            }
        }
        StepAction::Collect { rules, dest } => {
            format!(
                "mkdir -p {dest}\n{find}",
                dest = quote(dest),
                find = artifacts::find_command(rules, dest)
            )
        }
        StepAction::RunMatching {
            dir,
            suffix,
            max_depth,
        } => format!(
            "while IFS= read -r -d '' exe; do\n  echo \"running $exe\"\n  \"$exe\"\ndone < <(find -L {dir} -maxdepth {max_depth} -type f -perm /111 -name {pattern} -print0 | sort -z)",
            dir = quote(dir),
            pattern = quote(&format!("*{suffix}")),
        ),
        StepAction::RunFirstExecutable { dir, preferred } => {
            let names: Vec<String> = preferred.iter().map(|n| quote(n)).collect();
            format!(
                "exe=\"\"\n\
                 for name in {names}; do\n  if [ -x {dir}/\"$name\" ]; then exe={dir}/\"$name\"; break; fi\ndone\n\
                 if [ -z \"$exe\" ]; then\n  exe=\"$(find {dir} -maxdepth 1 -type f -perm /111 ! -name 'lib*' | sort | head -n 1)\"\nfi\n\
                 if [ -z \"$exe\" ]; then echo \"no executable found in \"{dir} >&2; exit 1; fi\n\
                 \"$exe\"",
                names = names.join(" "),
                dir = quote(dir),
            )
        }
    };

    if let Some(marker) = &step.skip_if_exists {
        let indented = body.replace('\n', "\n  ");
        body = format!("if [ ! -e {} ]; then\n  {indented}\nfi", quote(marker));
    }
    format!(
        "echo '==> {phase}'\nphase_code={code}\n{body}\n",
        phase = step.phase,
        code = step.phase.exit_code()
    )
}

/// Render the full script for `plan` with paths taken from `ctx`.
pub fn render(plan: &PipelinePlan, ctx: &PlanContext<'_>) -> Result<String, ScriptError> {
    let steps: Vec<String> = plan
        .steps
        .iter()
        .map(|step| render_step(step, ctx.stages.verbose))
        .collect();
    render_template(
        TEMPLATE,
        &[
            ("exports", exports(plan, ctx)?),
            ("source_dir", quote(&ctx.source_dir)),
            ("build_dir", quote(&ctx.build_dir)),
            ("output_dir", quote(&ctx.output_dir)),
            ("steps", steps.join("\n")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::artifacts::ArtifactRules;
    use crate::backend::{Location, Stages};
    use crate::config::ResolvedToolchain;

    fn context(tc: &ResolvedToolchain) -> PlanContext<'_> {
        PlanContext {
            toolchain: tc,
            project_name: "demo",
            source_dir: "/workspace".into(),
            build_dir: "/tmp/build".into(),
            deps_dir: "/tmp/deps".into(),
            output_dir: "/output".into(),
            stages: Stages::default(),
            location: Location::Container,
        }
    }

    fn plan() -> PipelinePlan {
        PipelinePlan {
            env: vec![("VCPKG_ROOT".into(), "/opt/vcpkg".into())],
            steps: vec![
                Step::exec(Phase::Configure, "cmake", ["-B", "/tmp/build", "-DNAME=a b"])
                    .unless_exists("/tmp/build/CMakeCache.txt"),
                Step::exec(Phase::Build, "cmake", ["--build", "/tmp/build"]).with_progress(),
                Step::collect(ArtifactRules::new("/tmp/build", 3), "/output"),
            ],
        }
    }

    #[test]
    fn template_requires_every_placeholder_and_value() {
        assert_eq!(
            render_template("a {{x}} b", &[("x", "1".into())]).unwrap(),
            "a 1 b"
        );
        assert_eq!(
            render_template("{{x}} {{y}}", &[("x", "1".into())]),
            Err(ScriptError::MissingValue("y".into()))
        );
        assert_eq!(
            render_template("{{x}}", &[("x", "1".into()), ("z", "2".into())]),
            Err(ScriptError::UnusedValue("z".into()))
        );
        assert_eq!(
            render_template("{{x", &[("x", "1".into())]),
            Err(ScriptError::Unterminated)
        );
    }

    #[test]
    fn env_key_validation() {
        assert!(is_valid_env_key("CC"));
        assert!(is_valid_env_key("_PRIVATE_1"));
        assert!(!is_valid_env_key("1ABC"));
        assert!(!is_valid_env_key("BAD-KEY"));
        assert!(!is_valid_env_key("X;rm"));
        assert!(!is_valid_env_key(""));
    }

    #[test]
    fn renders_steps_with_phase_codes() {
        let tc = ResolvedToolchain::native("linux");
        let script = render(&plan(), &context(&tc)).unwrap();
        assert!(script.starts_with("#!/usr/bin/env bash\nset -eo pipefail\n"));
        assert!(script.contains("export VCPKG_ROOT=/opt/vcpkg\n"));
        assert!(script.contains("cd /workspace\n"));
        assert!(script.contains(
            "phase_code=71\nif [ ! -e /tmp/build/CMakeCache.txt ]; then\n  run_quiet cmake -B /tmp/build '-DNAME=a b'\nfi\n"
        ));
        assert!(script.contains("phase_code=72\nrun_quiet cmake --build /tmp/build\n"));
        assert!(script.contains("phase_code=73\nmkdir -p /output\nfind /tmp/build -maxdepth 3"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn hostile_values_are_quoted() {
        let mut tc = ResolvedToolchain::native("linux");
        tc.settings
            .env
            .insert("CFLAGS".into(), "$(touch /pwned) `id`; echo 'x'".into());
        let mut plan = plan();
        plan.steps.push(Step::exec(
            Phase::Build,
            "cmake",
            ["--build", "/tmp/build", "--", "-DX=\"; rm -rf / #"],
        ));
        let script = render(&plan, &context(&tc)).unwrap();
        assert!(script.contains("export CFLAGS='$(touch /pwned) `id`; echo '\\''x'\\'''\n"));
        assert!(script.contains("'-DX=\"; rm -rf / #'"));
    }

    #[test]
    fn invalid_env_keys_are_rejected() {
        let mut tc = ResolvedToolchain::native("linux");
        tc.settings.env.insert("BAD KEY".into(), "1".into());
        assert_eq!(
            render(&plan(), &context(&tc)),
            Err(ScriptError::InvalidEnvKey("BAD KEY".into()))
        );
    }

    #[test]
    fn quiet_mode_buffers_build_but_streams_tests() {
        let tc = ResolvedToolchain::native("linux");
        let mut plan = plan();
        plan.steps.push(Step::exec(Phase::Test, "ctest", ["--test-dir", "/tmp/build"]));
        let script = render(&plan, &context(&tc)).unwrap();
        let build_line = script.lines().find(|line| line.contains("cmake --build"));
        assert_eq!(build_line, Some("run_quiet cmake --build /tmp/build"));
        assert!(script.contains("phase_code=74\nctest --test-dir /tmp/build\n"));
    }

    #[test]
    fn verbose_runs_configure_unbuffered() {
        let tc = ResolvedToolchain::native("linux");
        let mut ctx = context(&tc);
        ctx.stages.verbose = true;
        let script = render(&plan(), &ctx).unwrap();
        assert!(!script.contains("run_quiet cmake"));
    }
}
