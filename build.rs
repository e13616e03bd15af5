use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use walkdir::WalkDir;

// Directories whose Rust sources are held to the lint rules.
const SCANNED_DIRS: [&str; 3] = ["src", "tests", "benches"];

#[derive(Clone, Copy, PartialEq)]
enum MatchScope {
    // Skip lines that are entirely comments.
    Code,
    // The pattern itself anchors on a comment marker.
    Comment,
}

struct LintRule {
    stage: &'static str,
    pattern: &'static str,
    scope: MatchScope,
    summary: &'static str,
    hint: &'static str,
}

const RULES: [LintRule; 5] = [
    LintRule {
        stage: "scan allow(dead_code) attributes",
        pattern: r"#\s*!?\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        scope: MatchScope::Code,
        summary: "#[allow(dead_code)] attributes",
        hint: "Remove the unused item instead of silencing the warning.",
    },
    LintRule {
        stage: "scan #[ignore] test annotations",
        pattern: r"#\s*\[\s*ignore\b",
        scope: MatchScope::Code,
        summary: "ignored tests",
        hint: "Tests must run; delete or repair the test instead of ignoring it.",
    },
    LintRule {
        stage: "scan debug_assert usage",
        pattern: r"\bdebug_assert(_eq|_ne)?!",
        scope: MatchScope::Code,
        summary: "debug_assert! invocations",
        hint: "Check the condition unconditionally or return an error.",
    },
    LintRule {
        stage: "scan disallowed let ignore patterns",
        pattern: r"\blet\s+_\s*(:[^=]*)?=",
        scope: MatchScope::Code,
        summary: "`let _ =` discards",
        hint: "Handle the value or the error explicitly.",
    },
    LintRule {
        stage: "scan forbidden comment patterns",
        pattern: r"(//|/\*).*\b(?:CRITICAL|FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)\b",
        scope: MatchScope::Comment,
        summary: "change-log markers in comments",
        hint: "Comments describe the code as it is, not the edit that produced it.",
    },
];

// A custom "Sink" for the grep searcher. It collects every matching line of
// a single file so the report lists all of them at once.
struct ViolationCollector<'r> {
    rule: &'r LintRule,
    violations: Vec<String>,
    file_path: PathBuf,
}

static CURRENT_STAGE: OnceLock<Mutex<String>> = OnceLock::new();

fn warnings_enabled() -> bool {
    static ENABLE_WARNINGS: OnceLock<bool> = OnceLock::new();
    *ENABLE_WARNINGS.get_or_init(|| match std::env::var("BUILD_VERBOSE") {
        Ok(value) => {
            let normalized = value.trim();
            normalized.eq_ignore_ascii_case("true")
                || normalized.eq_ignore_ascii_case("yes")
                || normalized == "1"
        }
        Err(_) => false,
    })
}

fn update_stage(label: &str) {
    let tracker = CURRENT_STAGE.get_or_init(|| Mutex::new(String::new()));
    if let Ok(mut guard) = tracker.lock() {
        guard.clear();
        guard.push_str(label);
    }

    if warnings_enabled() {
        println!("cargo:warning=lm-accel build stage: {label}");
        io::stdout().flush().ok();
    }
}

fn emit_stage_detail(detail: &str) {
    if warnings_enabled() {
        println!("cargo:warning=lm-accel build detail: {detail}");
        io::stdout().flush().ok();
    }
}

fn install_stage_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let stage = CURRENT_STAGE
            .get()
            .and_then(|tracker| tracker.lock().ok().map(|guard| guard.clone()))
            .unwrap_or_default();
        eprintln!("build script panicked during stage: {stage}");
        previous(info);
    }));
}

impl<'r> ViolationCollector<'r> {
    fn new(rule: &'r LintRule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    // After searching, this method checks if any violations were found.
    // If so, it formats a detailed error message and returns it.
    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.summary,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.hint));

        Some(error_msg)
    }
}

impl Sink for ViolationCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        let is_pure_comment = line_text.trim_start().starts_with("//");
        if self.rule.scope == MatchScope::Code && is_pure_comment {
            return Ok(true);
        }

        // Format the violation string exactly as the `rg -n` command would.
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn main() {
    install_stage_panic_hook();

    update_stage("initialization");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LM_ACCEL_SKIP_LINT_CHECKS");
    let root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from("."),
    };
    for dir in SCANNED_DIRS {
        println!("cargo:rerun-if-changed={}", root.join(dir).display());
    }

    if std::env::var("LM_ACCEL_SKIP_LINT_CHECKS").is_ok() {
        update_stage("skipping lint checks (LM_ACCEL_SKIP_LINT_CHECKS set)");
        return;
    }
    if std::env::var("DOCS_RS").is_ok() {
        update_stage("skipping lint checks (docs.rs build)");
        return;
    }

    update_stage("collect source files");
    let sources = collect_sources(&root);
    emit_stage_detail(&format!("{} source files to scan", sources.len()));

    let mut all_violations = Vec::new();
    for rule in &RULES {
        update_stage(rule.stage);
        let violations = scan_with_rule(rule, &sources);
        emit_stage_detail(&format!(
            "{} identified {} violation groups",
            rule.stage,
            violations.len()
        ));
        all_violations.extend(violations);
    }

    if !all_violations.is_empty() {
        update_stage("report validation errors");
        eprintln!("\n❌ VALIDATION ERRORS");
        eprintln!("====================");

        let violation_count = all_violations.len();
        for violation in all_violations {
            eprintln!("{violation}");
            eprintln!("--------------------");
        }

        eprintln!(
            "\n⚠️ Found {} total code quality violations. Resolve them before committing.",
            violation_count
        );
        std::process::exit(1);
    }

    update_stage("build script completed");
    emit_stage_detail("Validation checks completed without errors");
}

fn collect_sources(root: &Path) -> Vec<PathBuf> {
    let mut sources = Vec::new();
    for dir in SCANNED_DIRS {
        let base = root.join(dir);
        if !base.is_dir() {
            continue;
        }
        sources.extend(
            WalkDir::new(&base)
                .into_iter()
                .filter_map(|e: Result<walkdir::DirEntry, walkdir::Error>| e.ok())
                .filter(|e: &walkdir::DirEntry| !is_in_ignored_directory(e.path()))
                .filter(|e: &walkdir::DirEntry| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path()),
        );
    }
    sources
}

fn scan_with_rule(rule: &LintRule, sources: &[PathBuf]) -> Vec<String> {
    let mut all_violations = Vec::new();

    let matcher = match RegexMatcher::new_line_matcher(rule.pattern) {
        Ok(matcher) => matcher,
        Err(e) => {
            all_violations.push(format!("Error creating regex for {}: {}", rule.stage, e));
            return all_violations;
        }
    };

    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = ViolationCollector::new(rule, path);
        if searcher.search_path(&matcher, path, &mut collector).is_err() {
            continue;
        }
        if let Some(error_message) = collector.check_and_get_error_message() {
            all_violations.push(error_message);
        }
    }
    all_violations
}

fn is_in_hidden_directory(path: impl AsRef<Path>) -> bool {
    path.as_ref().components().any(|component| {
        if let Component::Normal(name) = component {
            name.to_string_lossy().starts_with('.')
        } else {
            false
        }
    })
}

fn is_in_target_directory(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .components()
        .any(|component| matches!(component, Component::Normal(name) if name == "target"))
}

fn is_in_ignored_directory(path: impl AsRef<Path>) -> bool {
    is_in_target_directory(path.as_ref()) || is_in_hidden_directory(path.as_ref())
}
