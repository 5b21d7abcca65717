use regex::Regex;

use crate::models::{normalize_name, GLOBAL_TARGET};

/// 规则目标名称的匹配方式
///
/// 匹配不区分大小写。`*` 匹配任意长度，`?` 匹配单个字符；单独的 `*` 表示全局规则。
#[derive(Debug, Clone)]
pub enum NamePattern {
    Exact(String),
    Wildcard(Regex),
    Global,
}

impl NamePattern {
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        if target == GLOBAL_TARGET {
            return NamePattern::Global;
        }
        if !target.contains(['*', '?']) {
            return NamePattern::Exact(normalize_name(target));
        }

        match Regex::new(&wildcard_to_regex(target)) {
            Ok(regex) => NamePattern::Wildcard(regex),
            // 正则无法构造时按字面名称匹配
            Err(e) => {
                log::debug!("Invalid wildcard pattern {:?}: {}", target, e);
                NamePattern::Exact(normalize_name(target))
            }
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => normalize_name(name) == *exact,
            NamePattern::Wildcard(regex) => regex.is_match(name),
            NamePattern::Global => true,
        }
    }

    /// 越小越具体：精确 < 通配 < 全局
    pub fn specificity(&self) -> u8 {
        match self {
            NamePattern::Exact(_) => 0,
            NamePattern::Wildcard(_) => 1,
            NamePattern::Global => 2,
        }
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_is_case_insensitive() {
        let pattern = NamePattern::parse("App.exe");
        assert!(pattern.matches("app.EXE"));
        assert!(!pattern.matches("app.exe2"));
        assert_eq!(pattern.specificity(), 0);
    }

    #[test]
    fn test_wildcard() {
        let pattern = NamePattern::parse("chrom*");
        assert!(pattern.matches("chrome"));
        assert!(pattern.matches("Chromium"));
        assert!(!pattern.matches("xchrome"));

        let single = NamePattern::parse("node?");
        assert!(single.matches("node1"));
        assert!(!single.matches("node"));
        assert!(!single.matches("node12"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = NamePattern::parse("a.b*");
        assert!(pattern.matches("a.bc"));
        assert!(!pattern.matches("axbc"));
    }

    #[test]
    fn test_non_ascii_case_folding() {
        assert!(NamePattern::parse("Ärger.exe").matches("ärger.EXE"));
        assert!(NamePattern::parse("ärg*").matches("ÄRGER.exe"));
    }

    #[test]
    fn test_global() {
        let pattern = NamePattern::parse(" * ");
        assert!(pattern.matches("anything"));
        assert_eq!(pattern.specificity(), 2);
    }
}
