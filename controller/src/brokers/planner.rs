use catalog_osb_client::CatalogResponse;
use catalog_types::CatalogRestrictions;
use globset::Glob;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPlanEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub schemas: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogServiceEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plans: Vec<CatalogPlanEntry>,
}

pub fn parse_catalog(catalog: &CatalogResponse) -> Result<Vec<CatalogServiceEntry>, serde_json::Error> {
    catalog
        .services
        .iter()
        .map(|v| serde_json::from_value(v.clone()))
        .collect()
}

fn matches_any(globs: &[Glob], name: &str) -> bool {
    globs
        .iter()
        .any(|g| g.compile_matcher().is_match(name))
}

fn compile(patterns: &[String]) -> Vec<Glob> {
    patterns
        .iter()
        .filter_map(|p| Glob::new(p).ok())
        .collect()
}

/// Applies `catalogRestrictions` to a parsed catalog. A class is dropped
/// entirely if it fails the class restriction; otherwise its plan list is
/// filtered by the plan restriction independently. Empty restriction lists
/// mean "allow everything" (the default, unrestricted broker).
pub fn filter_catalog_entries(
    entries: Vec<CatalogServiceEntry>,
    restrictions: Option<&CatalogRestrictions>,
) -> Vec<CatalogServiceEntry> {
    let Some(restrictions) = restrictions else {
        return entries;
    };
    let class_globs = compile(&restrictions.service_class_restrictions);
    let plan_globs = compile(&restrictions.service_plan_restrictions);

    entries
        .into_iter()
        .filter(|e| class_globs.is_empty() || matches_any(&class_globs, &e.name))
        .map(|mut e| {
            if !plan_globs.is_empty() {
                e.plans.retain(|p| matches_any(&plan_globs, &p.name));
            }
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, plans: &[&str]) -> CatalogServiceEntry {
        CatalogServiceEntry {
            id: format!("{name}-id"),
            name: name.to_string(),
            description: None,
            bindable: true,
            plan_updateable: false,
            tags: vec![],
            plans: plans
                .iter()
                .map(|p| CatalogPlanEntry {
                    id: format!("{p}-id"),
                    name: p.to_string(),
                    description: None,
                    bindable: None,
                    free: false,
                    schemas: None,
                })
                .collect(),
        }
    }

    #[test]
    fn no_restrictions_keeps_everything() {
        let entries = vec![entry("db", &["small", "large"])];
        let filtered = filter_catalog_entries(entries.clone(), None);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].plans.len(), 2);
    }

    #[test]
    fn class_restriction_drops_non_matching_classes() {
        let entries = vec![entry("db", &["small"]), entry("cache", &["small"])];
        let restrictions = CatalogRestrictions {
            service_class_restrictions: vec!["db".to_string()],
            service_plan_restrictions: vec![],
        };
        let filtered = filter_catalog_entries(entries, Some(&restrictions));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "db");
    }

    #[test]
    fn plan_restriction_filters_plans_without_dropping_class() {
        let entries = vec![entry("db", &["small", "large"])];
        let restrictions = CatalogRestrictions {
            service_class_restrictions: vec![],
            service_plan_restrictions: vec!["small".to_string()],
        };
        let filtered = filter_catalog_entries(entries, Some(&restrictions));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].plans.len(), 1);
        assert_eq!(filtered[0].plans[0].name, "small");
    }

    #[test]
    fn glob_patterns_match() {
        let entries = vec![entry("db-postgres", &["x"]), entry("cache-redis", &["x"])];
        let restrictions = CatalogRestrictions {
            service_class_restrictions: vec!["db-*".to_string()],
            service_plan_restrictions: vec![],
        };
        let filtered = filter_catalog_entries(entries, Some(&restrictions));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "db-postgres");
    }
}
