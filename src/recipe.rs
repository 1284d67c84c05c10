//! RTDE recipe descriptors
//!
//! A recipe is the named, typed field list negotiated for a telemetry session.
//! Recipes come from a descriptor in the controller's own XML layout:
//!
//! ```xml
//! <rtde_config>
//!   <recipe key="state">
//!     <field name="actual_TCP_pose" type="VECTOR6D"/>
//!     <field name="robot_status_bits" type="UINT32"/>
//!   </recipe>
//! </rtde_config>
//! ```

use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Field names and their wire types, in negotiation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub names: Vec<String>,
    pub types: Vec<String>,
}

impl Recipe {
    pub fn new(fields: &[(&str, &str)]) -> Self {
        Self {
            names: fields.iter().map(|(n, _)| n.to_string()).collect(),
            types: fields.iter().map(|(_, t)| t.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Anything that can hand out a recipe by key
pub trait RecipeSource: Send + Sync {
    fn recipe(&self, key: &str) -> Result<Recipe>;
}

/// Parsed recipe descriptor file
#[derive(Debug, Clone, Default)]
pub struct RecipeFile {
    recipes: HashMap<String, Recipe>,
}

impl RecipeFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Recipe(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let recipe_pattern = Regex::new(r#"(?s)<recipe\s+key\s*=\s*"([^"]+)"\s*>(.*?)</recipe>"#)
            .map_err(|e| Error::Recipe(e.to_string()))?;
        let field_pattern =
            Regex::new(r#"<field\s+name\s*=\s*"([^"]+)"\s+type\s*=\s*"([^"]+)"\s*/>"#)
                .map_err(|e| Error::Recipe(e.to_string()))?;

        let mut recipes = HashMap::new();
        for captures in recipe_pattern.captures_iter(contents) {
            let key = captures[1].to_string();
            let body = &captures[2];

            let mut recipe = Recipe { names: Vec::new(), types: Vec::new() };
            for field in field_pattern.captures_iter(body) {
                recipe.names.push(field[1].to_string());
                recipe.types.push(field[2].to_string());
            }

            if recipe.is_empty() {
                return Err(Error::Recipe(format!("Recipe '{}' declares no fields", key)));
            }
            if recipes.insert(key.clone(), recipe).is_some() {
                return Err(Error::Recipe(format!("Recipe '{}' is declared twice", key)));
            }
        }

        if recipes.is_empty() {
            return Err(Error::Recipe("Descriptor contains no <recipe> elements".to_string()));
        }
        Ok(Self { recipes })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }
}

impl RecipeSource for RecipeFile {
    fn recipe(&self, key: &str) -> Result<Recipe> {
        self.recipes
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Recipe(format!("Recipe '{}' not found", key)))
    }
}

impl RecipeSource for Recipe {
    fn recipe(&self, _key: &str) -> Result<Recipe> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"<?xml version="1.0"?>
<rtde_config>
	<recipe key="state">
		<field name="actual_TCP_pose" type="VECTOR6D"/>
		<field name="robot_status_bits" type="UINT32"/>
	</recipe>
	<recipe key="setp">
		<field name="input_double_register_0" type="DOUBLE"/>
	</recipe>
</rtde_config>
"#;

    #[test]
    fn test_get_recipe_preserves_order() {
        let file = RecipeFile::parse(DESCRIPTOR).unwrap();
        let recipe = file.recipe("state").unwrap();
        assert_eq!(recipe.names, vec!["actual_TCP_pose", "robot_status_bits"]);
        assert_eq!(recipe.types, vec!["VECTOR6D", "UINT32"]);
        assert_eq!(file.keys().count(), 2);
    }

    #[test]
    fn test_shipped_descriptor() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/control_loop_configuration.xml");
        let recipe = RecipeFile::load(path).unwrap().recipe("state").unwrap();
        assert!(recipe.contains("actual_TCP_pose"));
        assert!(recipe.contains("robot_status_bits"));
    }

    #[test]
    fn test_unknown_recipe() {
        let file = RecipeFile::parse(DESCRIPTOR).unwrap();
        assert!(matches!(file.recipe("watchdog"), Err(Error::Recipe(_))));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_recipes() {
        assert!(RecipeFile::parse("<rtde_config></rtde_config>").is_err());
        assert!(RecipeFile::parse(r#"<recipe key="a"></recipe>"#).is_err());

        let duplicated = r#"<recipe key="a"><field name="x" type="DOUBLE"/></recipe>
<recipe key="a"><field name="y" type="DOUBLE"/></recipe>"#;
        assert!(RecipeFile::parse(duplicated).is_err());
    }
}
