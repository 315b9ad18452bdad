//! INI parsing: the single place where key names map to config fields.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};

use super::{ConfigError, ModelSection, ScenarioConfig};
use crate::batch::{BatchConfig, ExplicitSubset};
use crate::geo::BoundingBox;
use crate::model::ModelKind;
use crate::pipeline::{ModelRun, OutputSpec, PipelineConfig};
use crate::region::RegionId;

/// Parses an `Ini` into a scenario, starting from defaults.
pub(super) fn parse_ini(ini: &Ini, default_name: &str) -> Result<ScenarioConfig, ConfigError> {
    let scenario = ini
        .section(Some("scenario"))
        .ok_or_else(|| missing("scenario", "workspace_dir"))?;

    let name = value(scenario, "name")
        .map(str::to_string)
        .unwrap_or_else(|| default_name.to_string());
    let workspace_dir = PathBuf::from(required(scenario, "scenario", "workspace_dir")?);
    let watersheds_dir = PathBuf::from(required(scenario, "scenario", "watersheds_dir")?);

    let mut pipeline = PipelineConfig::default().with_workspace_dir(workspace_dir);
    if let Some(v) = value(scenario, "result_suffix") {
        pipeline = pipeline.with_result_suffix(v);
    }
    if let Some(v) = value(scenario, "keep_intermediate_files") {
        pipeline.keep_intermediate = parse_bool("scenario", "keep_intermediate_files", v)?;
    }
    if let Some(v) = value(scenario, "global_pixel_size_deg") {
        pipeline.global_pixel_size_deg = parse_positive("scenario", "global_pixel_size_deg", v)?;
    }
    if let Some(v) = value(scenario, "target_pixel_size_m") {
        pipeline.target_pixel_size_m = parse_positive("scenario", "target_pixel_size_m", v)?;
    }

    // [pool] section
    if let Some(section) = ini.section(Some("pool")) {
        if let Some(v) = value(section, "workers") {
            pipeline.workers = parse_count("pool", "workers", v)?;
        }
        if let Some(v) = value(section, "flush_threshold") {
            pipeline.flush_threshold = parse_count("pool", "flush_threshold", v)?;
        }
    }

    // [batching] section
    let mut batching = BatchConfig::default();
    if let Some(section) = ini.section(Some("batching")) {
        if let Some(v) = value(section, "cell_size_deg") {
            batching.cell_size_deg = parse_positive("batching", "cell_size_deg", v)?;
        }
        if let Some(v) = value(section, "min_area") {
            batching.min_area = parse_number("batching", "min_area", v)?;
        }
        if let Some(v) = value(section, "filter_bbox") {
            batching.filter_bbox = Some(parse_bbox("batching", "filter_bbox", v)?);
        }
    }

    // [subset] section
    if let Some(section) = ini.section(Some("subset")) {
        let mut subset = ExplicitSubset::new();
        for (collection, raw) in section.iter() {
            let ids = parse_ids("subset", collection, strip_comment(raw))?;
            subset.entry(collection.to_string()).or_default().extend(ids);
        }
        if !subset.is_empty() {
            batching.subset = Some(subset);
        }
    }

    let mut models = Vec::new();
    for kind in ModelKind::ALL {
        if let Some(section) = parse_model(ini, kind)? {
            models.push(section);
        }
    }

    Ok(ScenarioConfig {
        name,
        watersheds_dir,
        pipeline,
        batching,
        models,
    })
}

/// Parses `[sdr]`/`[ndr]` and their `.inputs`, `.outputs` and `.params`
/// subsections. Returns `None` when the model section is absent or disabled.
fn parse_model(ini: &Ini, kind: ModelKind) -> Result<Option<ModelSection>, ConfigError> {
    let name = kind.name();
    let Some(section) = ini.section(Some(name)) else {
        return Ok(None);
    };
    if let Some(v) = value(section, "enabled") {
        if !parse_bool(name, "enabled", v)? {
            return Ok(None);
        }
    }
    let command = required(section, name, "command")?.to_string();

    let mut run = ModelRun::new(kind);

    let inputs_name = format!("{}.inputs", name);
    if let Some(inputs) = ini.section(Some(inputs_name.as_str())) {
        for (key, raw) in inputs.iter() {
            if kind.input(key).is_none() {
                return Err(ConfigError::InvalidValue {
                    section: inputs_name.clone(),
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: format!("not an input of the {} model", name),
                });
            }
            run = run.with_input(key, strip_comment(raw));
        }
    }
    for input in kind.inputs().iter().filter(|i| i.required) {
        if !run.inputs.contains_key(input.name) {
            return Err(missing(&inputs_name, input.name));
        }
    }

    let outputs_name = format!("{}.outputs", name);
    if let Some(outputs) = ini.section(Some(outputs_name.as_str())) {
        let specs: Vec<OutputSpec> = outputs
            .iter()
            .map(|(local, mosaic)| {
                let mosaic = strip_comment(mosaic);
                if mosaic.is_empty() {
                    OutputSpec::with_default_mosaic(local)
                } else {
                    OutputSpec::new(local, mosaic)
                }
            })
            .collect();
        if !specs.is_empty() {
            run = run.with_outputs(specs);
        }
    }

    let params_name = format!("{}.params", name);
    if let Some(params) = ini.section(Some(params_name.as_str())) {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), strip_comment(v).to_string()))
            .collect();
        run.params = params;
    }

    Ok(Some(ModelSection { run, command }))
}

// =============================================================================
// Value helpers
// =============================================================================

/// Drops a trailing `; comment` or `# comment` and surrounding whitespace.
fn strip_comment(raw: &str) -> &str {
    let end = [" ;", "\t;", " #", "\t#"]
        .iter()
        .filter_map(|marker| raw.find(marker))
        .min()
        .unwrap_or(raw.len());
    raw[..end].trim()
}

/// A non-empty value for `key`.
fn value<'a>(section: &'a Properties, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .map(strip_comment)
        .filter(|v| !v.is_empty())
}

fn required<'a>(section: &'a Properties, name: &str, key: &str) -> Result<&'a str, ConfigError> {
    value(section, key).ok_or_else(|| missing(name, key))
}

fn missing(section: &str, key: &str) -> ConfigError {
    ConfigError::Missing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(section: &str, key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(invalid(section, key, v, "must be true or false")),
    }
}

fn parse_number(section: &str, key: &str, v: &str) -> Result<f64, ConfigError> {
    f64::from_str(v)
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| invalid(section, key, v, "must be a number"))
}

fn parse_positive(section: &str, key: &str, v: &str) -> Result<f64, ConfigError> {
    let n = parse_number(section, key, v)?;
    if n <= 0.0 {
        return Err(invalid(section, key, v, "must be greater than zero"));
    }
    Ok(n)
}

fn parse_count(section: &str, key: &str, v: &str) -> Result<usize, ConfigError> {
    v.parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(section, key, v, "must be a positive integer"))
}

fn parse_bbox(section: &str, key: &str, v: &str) -> Result<BoundingBox, ConfigError> {
    let reason = "expected min_lng, min_lat, max_lng, max_lat";
    let parts: Vec<f64> = v
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid(section, key, v, reason))?;
    let &[min_x, min_y, max_x, max_y] = parts.as_slice() else {
        return Err(invalid(section, key, v, reason));
    };
    let bbox = BoundingBox::new(min_x, min_y, max_x, max_y);
    if !bbox.is_valid() {
        return Err(invalid(section, key, v, "minimum exceeds maximum"));
    }
    Ok(bbox)
}

fn parse_ids(section: &str, key: &str, v: &str) -> Result<Vec<RegionId>, ConfigError> {
    v.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<RegionId>()
                .map_err(|_| invalid(section, key, v, "expected comma-separated region ids"))
        })
        .collect()
}
