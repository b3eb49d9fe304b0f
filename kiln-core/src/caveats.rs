// kiln-core/src/caveats.rs
use kiln_common::config::Config;
use kiln_common::model::formula::Formula;
use kiln_common::options::BuildConfiguration;

use crate::build::PlaceholderContext;

/// Caveats that apply to the installed configuration, placeholders expanded.
pub fn active_caveats(config: &Config, formula: &Formula, build_config: &BuildConfiguration) -> Vec<String> {
    let placeholders = PlaceholderContext::new(config, formula, 1);
    formula
        .caveats
        .iter()
        .filter(|c| c.when.as_deref().map_or(true, |opt| build_config.is_enabled(opt)))
        .map(|c| placeholders.expand(c.text.trim_end()))
        .collect()
}
