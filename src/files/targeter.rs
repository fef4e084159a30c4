//! Heuristic selection of the files an edit instruction is likely to touch.
//!
//! Each category carries a keyword list, a weight and a set of path rules.
//! A category scores `weight` for every keyword found in the instruction
//! (case-insensitive substring). Matched categories are ordered by score,
//! ties keep declaration order, and the union of their path matches is the
//! selection. No match at all falls back to every recognised source file;
//! an oversized union is narrowed to the top category when that helps.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Unions larger than this are narrowed to the top-scoring category.
pub const MAX_TARGETED_FILES: usize = 20;

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "css", "scss"];
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".next", ".git", "dist", "build"];

struct Category {
    name: &'static str,
    keywords: &'static [&'static str],
    weight: u32,
    path_rules: Vec<Regex>,
}

impl Category {
    fn new(
        name: &'static str,
        weight: u32,
        keywords: &'static [&'static str],
        patterns: &[&str],
    ) -> Self {
        Self {
            name,
            keywords,
            weight,
            path_rules: patterns
                .iter()
                .map(|p| Regex::new(p).expect("category path rule is a valid static regex"))
                .collect(),
        }
    }

    fn score(&self, instruction: &str) -> u32 {
        self.keywords
            .iter()
            .filter(|k| instruction.contains(*k))
            .count() as u32
            * self.weight
    }

    fn matches(&self, path: &str) -> bool {
        self.path_rules.iter().any(|rule| rule.is_match(path))
    }
}

static CATEGORIES: LazyLock<Vec<Category>> = LazyLock::new(|| {
    vec![
        Category::new(
            "styling",
            3,
            &[
                "color", "style", "css", "tailwind", "design", "theme", "font", "size", "layout",
                "spacing", "margin", "padding", "background", "border", "shadow", "gradient",
                "animation", "orange", "blue", "red", "green", "yellow", "purple", "pink",
            ],
            &[
                r"\.css$",
                r"\.scss$",
                r"tailwind\.config\.(js|ts)$",
                r"styles?\.(ts|tsx|js|jsx)$",
            ],
        ),
        Category::new(
            "components",
            2,
            &[
                "component", "button", "input", "form", "modal", "card", "header", "footer",
                "navbar", "sidebar", "menu", "dropdown", "page", "ui", "interface", "render",
                "display", "show",
            ],
            &[
                r"components/.*\.(tsx|jsx)$",
                r"app/.*page\.(tsx|jsx)$",
                r"src/.*\.(tsx|jsx)$",
            ],
        ),
        Category::new(
            "api",
            3,
            &[
                "api", "endpoint", "route", "server", "backend", "fetch", "request", "response",
                "data", "database",
            ],
            &[r"api/.*route\.(ts|js)$", r"/api/.*\.(ts|js)$"],
        ),
        Category::new(
            "logic",
            2,
            &[
                "function", "logic", "algorithm", "calculation", "util", "helper", "service",
                "hook", "state",
            ],
            &[
                r"lib/.*\.(ts|js)$",
                r"utils/.*\.(ts|js)$",
                r"hooks/.*\.(ts|js)$",
                r"services/.*\.(ts|js)$",
            ],
        ),
        Category::new(
            "config",
            4,
            &[
                "config", "configuration", "settings", "environment", "env", "setup", "install",
                "dependency", "package",
            ],
            &[
                r"package\.json$",
                r"tsconfig\.json$",
                r"next\.config\.(js|ts)$",
                r"\.env$",
                r".*\.config\.(js|ts)$",
            ],
        ),
    ]
});

/// Outcome of targeting: the chosen paths plus why they were chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSelection {
    pub paths: Vec<String>,
    /// Matched categories with their scores, highest first.
    pub categories: Vec<(&'static str, u32)>,
    /// True when no category matched and the source-file fallback was used.
    pub fallback: bool,
}

/// Pick the subset of `inventory` worth sending along with `instruction`.
pub fn select_files(instruction: &str, inventory: &[String]) -> TargetSelection {
    let ranked = rank_categories(instruction);
    let scores: Vec<(&'static str, u32)> = ranked.iter().map(|(c, s)| (c.name, *s)).collect();

    if ranked.is_empty() {
        tracing::debug!("No specific categories detected, using all source files");
        return fallback_selection(inventory, scores);
    }

    let categories: Vec<&Category> = ranked.iter().map(|(c, _)| *c).collect();
    let union = filter_by_categories(inventory, &categories);

    if union.is_empty() {
        tracing::debug!(categories = ?scores, "No matches, expanding to all source files");
        return fallback_selection(inventory, scores);
    }

    if union.len() > MAX_TARGETED_FILES {
        let top = filter_by_categories(inventory, &categories[..1]);
        if !top.is_empty() && top.len() < union.len() {
            tracing::debug!(
                from = union.len(),
                to = top.len(),
                category = categories[0].name,
                "Narrowed oversized selection to top category"
            );
            return TargetSelection {
                paths: top,
                categories: scores,
                fallback: false,
            };
        }
    }

    TargetSelection {
        paths: union,
        categories: scores,
        fallback: false,
    }
}

fn rank_categories(instruction: &str) -> Vec<(&'static Category, u32)> {
    let lowered = instruction.to_lowercase();
    let mut ranked: Vec<(&'static Category, u32)> = CATEGORIES
        .iter()
        .map(|c| (c, c.score(&lowered)))
        .filter(|(_, score)| *score > 0)
        .collect();
    // Stable: equal scores keep declaration order.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

fn filter_by_categories(inventory: &[String], categories: &[&Category]) -> Vec<String> {
    let mut seen = HashSet::new();
    inventory
        .iter()
        .filter(|path| categories.iter().any(|c| c.matches(path)))
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

fn fallback_selection(inventory: &[String], categories: Vec<(&'static str, u32)>) -> TargetSelection {
    TargetSelection {
        paths: inventory
            .iter()
            .filter(|p| is_source_file(p))
            .cloned()
            .collect(),
        categories,
        fallback: true,
    }
}

/// A recognised source file outside build/output directories.
pub fn is_source_file(path: &str) -> bool {
    let in_excluded_dir = path
        .split('/')
        .any(|segment| EXCLUDED_DIRS.contains(&segment));
    let has_source_extension = path
        .rsplit_once('.')
        .is_some_and(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext));
    has_source_extension && !in_excluded_dir
}

/// Whether an instruction reads like a request to change existing code.
pub fn needs_file_context(instruction: &str) -> bool {
    const EDIT_VERBS: &[&str] = &[
        "change", "update", "modify", "fix", "edit", "remove", "add", "create", "make", "set",
        "adjust", "improve",
    ];
    let lowered = instruction.to_lowercase();
    EDIT_VERBS.iter().any(|verb| lowered.contains(verb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_color_instruction_targets_css_not_package_json() {
        let files = inventory(&["src/app/globals.css", "src/lib/api.ts", "package.json"]);
        let selection = select_files("change the button color to orange", &files);

        assert!(selection.paths.contains(&"src/app/globals.css".to_string()));
        assert!(!selection.paths.contains(&"package.json".to_string()));
        assert!(!selection.fallback);
        assert_eq!(selection.categories[0].0, "styling");
    }

    #[test]
    fn test_scores_accumulate_per_keyword() {
        let selection = select_files("change the button color to orange", &[]);
        // "color" + "orange" for styling, "button" for components
        assert_eq!(selection.categories, vec![("styling", 6), ("components", 2)]);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        // "css" -> styling(3); "api" -> api(3)
        let selection = select_files("CSS for the API", &[]);
        assert_eq!(selection.categories, vec![("styling", 3), ("api", 3)]);
    }

    #[test]
    fn test_no_category_falls_back_to_source_files() {
        let files = inventory(&[
            "src/app/page.tsx",
            "README.md",
            "node_modules/react/index.js",
            ".next/server/app.js",
            "src/app/globals.css",
        ]);
        let selection = select_files("make it better", &files);

        assert!(selection.fallback);
        assert_eq!(
            selection.paths,
            vec!["src/app/page.tsx".to_string(), "src/app/globals.css".to_string()]
        );
    }

    #[test]
    fn test_matched_category_without_files_falls_back() {
        let files = inventory(&["src/app/page.tsx"]);
        let selection = select_files("update the database endpoint", &files);

        assert!(selection.fallback);
        assert_eq!(selection.paths, vec!["src/app/page.tsx".to_string()]);
        assert_eq!(selection.categories[0].0, "api");
    }

    #[test]
    fn test_config_instruction_targets_config_files() {
        let files = inventory(&[
            "package.json",
            "tsconfig.json",
            "next.config.ts",
            "src/app/page.tsx",
        ]);
        let selection = select_files("install a new dependency", &files);

        assert_eq!(
            selection.paths,
            vec![
                "package.json".to_string(),
                "tsconfig.json".to_string(),
                "next.config.ts".to_string()
            ]
        );
    }

    #[test]
    fn test_oversized_union_narrows_to_top_category() {
        let mut paths: Vec<String> = (0..25)
            .map(|i| format!("src/components/Widget{}.tsx", i))
            .collect();
        paths.push("src/app/globals.css".to_string());
        paths.push("src/styles/theme.css".to_string());

        // styling scores 6 (color, orange), components 2 (button)
        let selection = select_files("change the button color to orange", &paths);

        assert_eq!(
            selection.paths,
            vec![
                "src/app/globals.css".to_string(),
                "src/styles/theme.css".to_string()
            ]
        );
    }

    #[test]
    fn test_oversized_union_kept_when_top_category_is_empty() {
        let paths: Vec<String> = (0..25)
            .map(|i| format!("src/components/Widget{}.tsx", i))
            .collect();

        let selection = select_files("change the button color to orange", &paths);
        assert_eq!(selection.paths.len(), 25);
    }

    #[test]
    fn test_selection_has_no_duplicates() {
        let files = inventory(&["src/app/globals.css", "src/app/globals.css"]);
        let selection = select_files("tweak the colors", &files);
        assert_eq!(selection.paths, vec!["src/app/globals.css".to_string()]);
    }

    #[test]
    fn test_is_source_file() {
        assert!(is_source_file("src/app/page.tsx"));
        assert!(is_source_file("styles.scss"));
        assert!(!is_source_file("README.md"));
        assert!(!is_source_file("dist/bundle.js"));
        assert!(!is_source_file("Makefile"));
    }

    #[test]
    fn test_needs_file_context() {
        assert!(needs_file_context("Please fix the header"));
        assert!(needs_file_context("ADD a footer"));
        assert!(!needs_file_context("what framework is this?"));
    }
}
