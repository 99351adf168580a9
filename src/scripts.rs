use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, AST, FLOAT, INT};

use crate::handle::EntityHandle;
use crate::host::{InvalidHandle, NormalizeFn, TransformHost, TransformView};
use crate::math::Vector3;
use crate::proxy::EntityProxy;

// ---------- Instances ----------
/// A behaviour instance starts `Constructed` (state initialized, no entity
/// interaction yet) and moves to `Running` on its first update call.
/// Detaching removes it; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Constructed,
    Running,
}

struct ScriptInstance {
    script_path: PathBuf,
    state: Dynamic,
    phase: InstancePhase,
    error: Option<String>,
}

struct Program {
    ast: AST,
    last_modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub updated: usize,
    pub skipped: usize,
    pub detached: Vec<EntityHandle>,
}

// ---------- Host ----------
/// Owns the embedded interpreter, the compiled behaviour programs, and one
/// instance per attached entity. Drives `update(dt, entity)` once per frame
/// per instance, in attach order.
pub struct ScriptHost {
    engine: Engine,
    programs: HashMap<PathBuf, Program>,
    instances: HashMap<EntityHandle, ScriptInstance>,
    order: Vec<EntityHandle>,
    pending_detach: Vec<EntityHandle>,
    normalize: Option<NormalizeFn>,
    logs: Arc<Mutex<Vec<String>>>,
    last_error: Option<String>,
    enabled: bool,
}

impl ScriptHost {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        let logs = Arc::new(Mutex::new(Vec::new()));
        register_api(&mut engine, Arc::clone(&logs));
        Self {
            engine,
            programs: HashMap::new(),
            instances: HashMap::new(),
            order: Vec::new(),
            pending_detach: Vec::new(),
            normalize: None,
            logs,
            last_error: None,
            enabled: true,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enable: bool) {
        self.enabled = enable;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_attached(&self, handle: EntityHandle) -> bool {
        self.instances.contains_key(&handle)
    }

    pub fn phase(&self, handle: EntityHandle) -> Option<InstancePhase> {
        self.instances.get(&handle).map(|instance| instance.phase)
    }

    pub fn set_normalize_hook(&mut self, hook: NormalizeFn) {
        self.normalize = Some(hook);
    }

    pub fn clear_normalize_hook(&mut self) {
        self.normalize = None;
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        match self.logs.lock() {
            Ok(mut sink) => std::mem::take(&mut *sink),
            Err(_) => Vec::new(),
        }
    }

    /// Compiles (or recompiles) a behaviour script and caches the program.
    pub fn load_program(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading script '{}'", path.display()))?;
        let ast = self
            .engine
            .compile(&source)
            .with_context(|| format!("compiling script '{}'", path.display()))?;
        let last_modified = fs::metadata(path).ok().and_then(|meta| meta.modified().ok());
        self.programs.insert(path.to_path_buf(), Program { ast, last_modified });
        Ok(())
    }

    /// Binds a behaviour script to an entity handle. Construction runs the
    /// script's zero-argument `init()` (if any) to produce the instance's
    /// private state; it never touches the entity, so the handle does not
    /// have to be live yet.
    pub fn attach(&mut self, handle: EntityHandle, script_path: impl AsRef<Path>) -> Result<()> {
        let path = script_path.as_ref().to_path_buf();
        if !self.programs.contains_key(&path) {
            self.load_program(&path)?;
        }
        let program = &self.programs[&path];
        let state = construct_state(&self.engine, &program.ast)
            .with_context(|| format!("constructing instance of '{}'", path.display()))?;
        if !self.instances.contains_key(&handle) {
            self.order.push(handle);
        }
        self.instances.insert(
            handle,
            ScriptInstance {
                script_path: path,
                state,
                phase: InstancePhase::Constructed,
                error: None,
            },
        );
        Ok(())
    }

    /// Requests removal of a binding. Never interrupts an update already in
    /// progress; the instance stops being scheduled at the next frame
    /// boundary.
    pub fn detach(&mut self, handle: EntityHandle) {
        if !self.pending_detach.contains(&handle) {
            self.pending_detach.push(handle);
        }
    }

    /// Runs one frame: applies pending detaches, then updates every attached
    /// instance in attach order. An instance whose handle the host reports
    /// dead is detached and reported; script errors skip the instance but
    /// keep the binding so a reload can revive it.
    pub fn run_frame(&mut self, host: &mut dyn TransformHost, dt: f64) -> FrameReport {
        let mut report = FrameReport::default();
        self.apply_pending_detaches();
        if !self.enabled {
            return report;
        }
        for handle in self.order.clone() {
            match self.update_instance(host, handle, dt) {
                Ok(true) => report.updated += 1,
                Ok(false) => report.skipped += 1,
                Err(InvalidHandle(dead)) => {
                    self.remove_instance(dead);
                    report.detached.push(dead);
                }
            }
        }
        report
    }

    /// Per-frame call for a single binding. Fails with `InvalidHandle`
    /// before the script runs when the host reports the handle dead, so no
    /// write can have happened. The binding itself is left in place; detach
    /// policy belongs to the caller (`run_frame` detaches).
    pub fn update_entity(
        &mut self,
        host: &mut dyn TransformHost,
        handle: EntityHandle,
        dt: f64,
    ) -> Result<(), InvalidHandle> {
        self.update_instance(host, handle, dt).map(|_| ())
    }

    /// Recompiles every cached program and reconstructs the state of all
    /// instances, clearing sticky errors.
    pub fn force_reload(&mut self) -> Result<()> {
        let paths: Vec<PathBuf> = self.programs.keys().cloned().collect();
        for path in paths {
            self.load_program(&path)?;
            self.reset_instances_of(&path)?;
        }
        self.last_error = None;
        Ok(())
    }

    fn update_instance(
        &mut self,
        host: &mut dyn TransformHost,
        handle: EntityHandle,
        dt: f64,
    ) -> Result<bool, InvalidHandle> {
        let path = match self.instances.get(&handle) {
            Some(instance) => instance.script_path.clone(),
            None => return Ok(false),
        };

        // Aliveness gate before anything else: a dead handle must surface
        // typed, with the script never observing the frame.
        let proxy = EntityProxy::resolve(host, &self.normalize, handle)?;

        if let Err(err) = self.reload_if_changed(&path) {
            self.record_failure(handle, format!("{err:#}"));
            return Ok(false);
        }

        let instance = match self.instances.get_mut(&handle) {
            Some(instance) => instance,
            None => return Ok(false),
        };
        if instance.error.is_some() {
            return Ok(false);
        }
        let program = match self.programs.get(&path) {
            Some(program) => program,
            None => return Ok(false),
        };

        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut instance.state);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &program.ast,
            "update",
            (dt, proxy),
        );

        match result {
            Ok(_) => {
                instance.phase = InstancePhase::Running;
                Ok(true)
            }
            Err(err) if is_function_missing(&err) => {
                // A behaviour without an update function is inert, not broken.
                instance.phase = InstancePhase::Running;
                Ok(true)
            }
            Err(err) => {
                if let Some(invalid) = invalid_handle_in(&err) {
                    return Err(invalid);
                }
                self.record_failure(handle, err.to_string());
                Ok(false)
            }
        }
    }

    fn reload_if_changed(&mut self, path: &Path) -> Result<()> {
        let modified = fs::metadata(path)
            .with_context(|| format!("script file '{}' not accessible", path.display()))?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let stale = match self.programs.get(path) {
            Some(program) => program.last_modified.map_or(true, |prev| modified > prev),
            None => true,
        };
        if stale {
            self.load_program(path)?;
            self.reset_instances_of(path)?;
        }
        Ok(())
    }

    fn reset_instances_of(&mut self, path: &Path) -> Result<()> {
        let program = match self.programs.get(path) {
            Some(program) => program,
            None => return Ok(()),
        };
        for instance in self
            .instances
            .values_mut()
            .filter(|instance| instance.script_path.as_path() == path)
        {
            instance.state = construct_state(&self.engine, &program.ast)?;
            instance.phase = InstancePhase::Constructed;
            instance.error = None;
        }
        Ok(())
    }

    fn record_failure(&mut self, handle: EntityHandle, message: String) {
        eprintln!("[script] {message}");
        if let Some(instance) = self.instances.get_mut(&handle) {
            instance.error = Some(message.clone());
        }
        self.last_error = Some(message);
    }

    fn apply_pending_detaches(&mut self) {
        for handle in std::mem::take(&mut self.pending_detach) {
            self.remove_instance(handle);
        }
    }

    fn remove_instance(&mut self, handle: EntityHandle) {
        if self.instances.remove(&handle).is_some() {
            self.order.retain(|&attached| attached != handle);
        }
    }
}

/// Runs the script's zero-argument `init()` to build the private state bound
/// as `this` during updates. A script without `init` gets an empty map.
fn construct_state(engine: &Engine, ast: &AST) -> Result<Dynamic> {
    let mut scope = Scope::new();
    match engine.call_fn::<Dynamic>(&mut scope, ast, "init", ()) {
        Ok(state) => Ok(state),
        Err(err) if is_function_missing(&err) => Ok(Dynamic::from(Map::new())),
        Err(err) => Err(anyhow!("running init: {err}")),
    }
}

fn register_api(engine: &mut Engine, logs: Arc<Mutex<Vec<String>>>) {
    engine.register_type_with_name::<Vector3>("Vector3");
    engine.register_fn("vec3", || Vector3::ZERO);
    engine.register_fn("vec3", |x: FLOAT| Vector3::new(x, 0.0, 0.0));
    engine.register_fn("vec3", |x: FLOAT, y: FLOAT| Vector3::new(x, y, 0.0));
    engine.register_fn("vec3", |x: FLOAT, y: FLOAT, z: FLOAT| Vector3::new(x, y, z));
    engine.register_fn("+", |a: Vector3, b: Vector3| a + b);
    engine.register_get("x", |v: &mut Vector3| v.x);
    engine.register_get("y", |v: &mut Vector3| v.y);
    engine.register_get("z", |v: &mut Vector3| v.z);
    engine.register_fn("to_string", |v: &mut Vector3| v.to_string());

    engine.register_type_with_name::<TransformView>("Transform");
    engine.register_get("position", |view: &mut TransformView| view.position);

    engine.register_type_with_name::<EntityProxy>("Entity");
    engine.register_get_set(
        "position",
        EntityProxy::script_get_position,
        EntityProxy::script_set_position,
    );
    engine.register_fn("get_position", EntityProxy::script_get_position);
    engine.register_fn("set_position", EntityProxy::script_set_position);
    engine.register_fn("get_transform", EntityProxy::script_get_transform);
    engine.register_get("handle", |proxy: &mut EntityProxy| proxy.handle().to_bits() as INT);

    engine.register_fn("log", move |message: &str| {
        if let Ok(mut sink) = logs.lock() {
            sink.push(message.to_string());
        }
    });
}

fn is_function_missing(err: &EvalAltResult) -> bool {
    matches!(err, EvalAltResult::ErrorFunctionNotFound(..))
}

/// Digs a typed `InvalidHandle` out of a nested interpreter error, if the
/// failure originated in a proxy accessor.
fn invalid_handle_in(err: &EvalAltResult) -> Option<InvalidHandle> {
    match err {
        EvalAltResult::ErrorRuntime(payload, _) => payload.clone().try_cast::<InvalidHandle>(),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => invalid_handle_in(inner),
        _ => None,
    }
}
