//! Production Code Checks
//!
//! Only code before the first `#[cfg(test)]` of a file counts as production
//! code. Test modules are free to unwrap.

use std::fs;
use std::path::{Path, PathBuf};

/// Module names that say nothing about what the module does.
const BANNED_MODULE_NAMES: &[&str] = &["utils", "util", "helpers", "helper", "common", "misc"];

/// A rule violation in production code
#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    rule: &'static str,
    context: String,
}

struct ProductionCodeChecker {
    violations: Vec<Violation>,
    files_checked: usize,
}

impl ProductionCodeChecker {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            files_checked: 0,
        }
    }

    /// Source directories of all `tidestream-*` crates
    fn source_roots() -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
        let workspace = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .ok_or("tests crate has no parent directory")?;

        let mut roots = Vec::new();
        for entry in fs::read_dir(workspace)? {
            let path = entry?.path();
            let is_crate = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("tidestream-"));
            if is_crate && path.join("src").is_dir() {
                roots.push(path.join("src"));
            }
        }
        Ok(roots)
    }

    fn find_rust_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::find_rust_files(&path, files)?;
            } else if path.extension().is_some_and(|extension| extension == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn check_workspace(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut files = Vec::new();
        for root in Self::source_roots()? {
            Self::find_rust_files(&root, &mut files)?;
        }

        for file in files {
            let content = fs::read_to_string(&file)?;
            self.check_source(&file.to_string_lossy(), &content);
        }
        Ok(())
    }

    fn check_source(&mut self, file_path: &str, content: &str) {
        self.files_checked += 1;

        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }

            let rule = if trimmed.contains("#[allow(") && trimmed.contains("dead_code") {
                Some("dead code allowance")
            } else if trimmed.contains(".unwrap()") || trimmed.contains(".expect(") {
                Some("panicking unwrap")
            } else if let Some(name) = trimmed
                .strip_prefix("pub mod ")
                .or_else(|| trimmed.strip_prefix("mod "))
                .map(|rest| rest.trim_end_matches(';').trim())
                && BANNED_MODULE_NAMES.contains(&name)
            {
                Some("catch-all module name")
            } else {
                None
            };

            if let Some(rule) = rule {
                self.violations.push(Violation {
                    file_path: file_path.to_string(),
                    line_number: index + 1,
                    rule,
                    context: trimmed.to_string(),
                });
            }
        }
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Production code checks: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        println!("Production code violations found:");
        for violation in &self.violations {
            println!(
                "{}:{} [{}]\n  {}",
                violation.file_path, violation.line_number, violation.rule, violation.context
            );
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_stop_at_test_module() {
        let mut checker = ProductionCodeChecker::new();
        let source = r#"
pub mod helpers;

#[allow(dead_code)]
fn parse(input: &str) -> u32 {
    input.parse().unwrap()
}

#[cfg(test)]
mod tests {
    fn check() {
        "1".parse::<u32>().unwrap();
    }
}
"#;

        checker.check_source("sample.rs", source);

        let rules: Vec<_> = checker
            .violations
            .iter()
            .map(|violation| (violation.line_number, violation.rule))
            .collect();
        assert_eq!(
            rules,
            vec![
                (2, "catch-all module name"),
                (4, "dead code allowance"),
                (6, "panicking unwrap"),
            ]
        );
    }

    #[test]
    fn production_code_enforcement() {
        let mut checker = ProductionCodeChecker::new();

        checker
            .check_workspace()
            .expect("Failed to scan workspace sources");

        assert!(checker.files_checked > 0, "No workspace sources found");
        assert!(
            checker.report_violations(),
            "Production code violations found - see output above"
        );
    }
}
