use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::handle::EntityHandle;
use crate::host::NormalizeFn;
use crate::math::Vector3;
use crate::scripts::ScriptHost;
use crate::world::HostWorld;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default)]
    pub normalize: Option<NormalizeConfig>,
    pub behaviours: Vec<FixtureBehaviour>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureBehaviour {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<[f64; 3]>,
    /// Despawn the entity right before this step runs, leaving the script
    /// bound to a dead handle.
    #[serde(default)]
    pub despawn_after: Option<usize>,
}

/// Declarative normalization hooks for fixtures, mirroring the usual host
/// policies: clamp to a world box, or snap to a grid step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeConfig {
    Clamp { min: [f64; 3], max: [f64; 3] },
    Snap { step: f64 },
}

impl NormalizeConfig {
    pub fn into_hook(self) -> NormalizeFn {
        match self {
            NormalizeConfig::Clamp { min, max } => Box::new(move |v: Vector3| {
                Vector3::new(
                    v.x.clamp(min[0], max[0]),
                    v.y.clamp(min[1], max[1]),
                    v.z.clamp(min[2], max[2]),
                )
            }),
            NormalizeConfig::Snap { step } => Box::new(move |v: Vector3| {
                Vector3::new(
                    (v.x / step).round() * step,
                    (v.y / step).round() * step,
                    (v.z / step).round() * step,
                )
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub steps: usize,
    pub dt: f64,
    pub behaviours: Vec<String>,
    pub results: Vec<StepResult>,
    pub final_entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub updated: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detached: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    let mut world = HostWorld::new();
    let mut scripts = ScriptHost::new();
    if let Some(config) = fixture.normalize {
        scripts.set_normalize_hook(config.into_hook());
    }

    let mut labels: Vec<(EntityHandle, String)> = Vec::new();
    let mut despawn_plan: Vec<(usize, EntityHandle)> = Vec::new();
    for (idx, behaviour) in fixture.behaviours.iter().enumerate() {
        let position = behaviour
            .position
            .map(|[x, y, z]| Vector3::new(x, y, z))
            .unwrap_or(Vector3::ZERO);
        let handle = world.spawn_at(position);
        scripts
            .attach(handle, &behaviour.path)
            .with_context(|| format!("attaching '{}'", behaviour.path))?;
        let label = behaviour.name.clone().unwrap_or_else(|| format!("entity{idx}"));
        labels.push((handle, label));
        if let Some(step) = behaviour.despawn_after {
            despawn_plan.push((step, handle));
        }
    }

    let mut results = Vec::with_capacity(fixture.steps);
    for step in 0..fixture.steps {
        for &(at, handle) in &despawn_plan {
            if at == step {
                world.despawn(handle);
            }
        }
        let report = scripts.run_frame(&mut world, fixture.dt);
        results.push(StepResult {
            step,
            updated: report.updated,
            logs: scripts.take_logs(),
            detached: report
                .detached
                .iter()
                .map(|handle| label_of(&labels, *handle))
                .collect(),
        });
    }

    let mut final_entities: Vec<EntitySummary> = labels
        .iter()
        .map(|(handle, label)| {
            let position = world.position(*handle);
            EntitySummary {
                name: Some(label.clone()),
                alive: position.is_some(),
                position: position.map(|p| [p.x, p.y, p.z]),
            }
        })
        .collect();
    final_entities.sort_by(|a, b| a.name.cmp(&b.name));

    let behaviours = fixture.behaviours.iter().map(|b| b.path.clone()).collect();
    Ok(HarnessOutput {
        steps: fixture.steps,
        dt: fixture.dt,
        behaviours,
        results,
        final_entities,
    })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    Ok(serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?)
}

fn label_of(labels: &[(EntityHandle, String)], handle: EntityHandle) -> String {
    labels
        .iter()
        .find(|(attached, _)| *attached == handle)
        .map(|(_, label)| label.clone())
        .unwrap_or_else(|| handle.to_string())
}

fn default_dt() -> f64 {
    0.016
}

fn default_steps() -> usize {
    3
}
