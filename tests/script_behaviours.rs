use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use osprey_scripting::host::InvalidHandle;
use osprey_scripting::math::Vector3;
use osprey_scripting::scripts::{InstancePhase, ScriptHost};
use osprey_scripting::world::HostWorld;
use tempfile::NamedTempFile;

fn write_script(contents: &str) -> NamedTempFile {
    let mut temp = NamedTempFile::new().expect("temp script");
    write!(temp, "{contents}").expect("write script");
    temp
}

const COUNTER_SCRIPT: &str = r#"
    fn init() {
        #{ ticks: 0 }
    }

    fn update(dt, entity) {
        this.ticks += 1;
        entity.set_position(vec3(1.0 * this.ticks, 0.0, 0.0));
    }
"#;

#[test]
fn construction_runs_init_without_entity_interaction() {
    let script = write_script(
        r#"
            fn init() {
                log("constructed");
                #{ ticks: 0 }
            }

            fn update(dt, entity) {
                this.ticks += 1;
                log("tick");
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    world.despawn(handle);

    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach must not need a live entity");
    assert_eq!(scripts.take_logs(), vec!["constructed".to_string()], "init runs exactly once");
    assert_eq!(scripts.phase(handle), Some(InstancePhase::Constructed));

    let err = scripts.update_entity(&mut world, handle, 0.016).unwrap_err();
    assert_eq!(err, InvalidHandle(handle));
    assert!(scripts.take_logs().is_empty(), "script must not observe a dead-handle frame");
    assert!(scripts.is_attached(handle), "update_entity leaves detach policy to the caller");
}

#[test]
fn update_runs_each_frame_and_state_persists() {
    let script = write_script(COUNTER_SCRIPT);
    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    for _ in 0..3 {
        let report = scripts.run_frame(&mut world, 0.016);
        assert_eq!(report.updated, 1);
        assert!(report.detached.is_empty());
    }

    assert_eq!(world.position(handle), Some(Vector3::new(3.0, 0.0, 0.0)));
    assert_eq!(scripts.phase(handle), Some(InstancePhase::Running));
}

#[test]
fn oscillator_wraps_exactly_at_the_period() {
    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, "assets/scripts/oscillator.rhai").expect("attach");

    // Velocity 2.0/s over [-2.5, 2.5) with dt 0.25: exactly 0.5 per step,
    // one full period every 10 steps.
    for step in 1..=20 {
        scripts.run_frame(&mut world, 0.25);
        let position = world.position(handle).expect("entity stays alive");
        assert!(
            position.x < 2.5,
            "x must never reach the upper bound, got {} at step {step}",
            position.x
        );
        assert_eq!(position.y, -4.8);
        assert_eq!(position.z, -6.0);
        if step % 10 == 0 {
            assert_eq!(position.x, -2.5, "period must close exactly at step {step}");
        }
    }
}

#[test]
fn zero_dt_leaves_position_unchanged() {
    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::new(1.0, 2.0, 3.0));
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, "assets/scripts/drifter.rhai").expect("attach");

    for _ in 0..2 {
        scripts.run_frame(&mut world, 0.0);
    }
    assert_eq!(world.position(handle), Some(Vector3::new(1.0, 2.0, 3.0)));
}

#[test]
fn patrol_wraps_to_the_lower_bound() {
    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::new(799.0, 0.0, 0.0));
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, "assets/scripts/patrol.rhai").expect("attach");

    scripts.run_frame(&mut world, 0.25);
    assert_eq!(world.position(handle), Some(Vector3::new(-800.0, 0.0, 0.0)));
}

#[test]
fn dead_handles_are_detached_and_write_nothing() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                log("ran");
                entity.set_position(vec3(9.0, 9.0, 9.0));
            }
        "#,
    );

    let mut world = HostWorld::new();
    let first = world.spawn_at(Vector3::ZERO);
    let second = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(first, script.path()).expect("attach first");
    scripts.attach(second, script.path()).expect("attach second");

    world.despawn(first);
    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.detached, vec![first]);
    assert_eq!(report.updated, 1);
    assert_eq!(scripts.take_logs(), vec!["ran".to_string()], "only the live entity runs");
    assert!(!scripts.is_attached(first));
    assert_eq!(world.position(first), None);
    assert_eq!(world.position(second), Some(Vector3::new(9.0, 9.0, 9.0)));
}

#[test]
fn normalize_hook_applies_exactly_once_per_update() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                let p = entity.position;
                entity.position = p + vec3(1.0, 1.0, 0.0);
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::new(0.0, 5.0, 0.0));
    let mut scripts = ScriptHost::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    scripts.set_normalize_hook(Box::new(move |v| {
        seen.fetch_add(1, Ordering::SeqCst);
        Vector3::new(v.x, 0.0, v.z)
    }));
    scripts.attach(handle, script.path()).expect("attach");

    scripts.run_frame(&mut world, 0.016);
    scripts.run_frame(&mut world, 0.016);

    assert_eq!(calls.load(Ordering::SeqCst), 2, "one write-back per update, reads never count");
    assert_eq!(world.position(handle), Some(Vector3::new(2.0, 0.0, 0.0)));

    // Without the hook, writes pass through untouched.
    scripts.clear_normalize_hook();
    scripts.run_frame(&mut world, 0.016);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(world.position(handle), Some(Vector3::new(3.0, 1.0, 0.0)));
}

#[test]
fn script_errors_stick_and_skip_until_reload() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                log("before");
                throw "boom";
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(scripts.take_logs(), vec!["before".to_string()]);
    let error = scripts.last_error().expect("error should surface").to_string();
    assert!(error.contains("boom"), "unexpected error text: {error}");

    // Errored instance skips further calls entirely.
    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.skipped, 1);
    assert!(scripts.take_logs().is_empty(), "sticky errors must suppress callbacks");
    assert!(scripts.is_attached(handle), "plain script errors keep the binding");

    // A reload revives it.
    scripts.force_reload().expect("reload");
    scripts.run_frame(&mut world, 0.016);
    assert_eq!(scripts.take_logs(), vec!["before".to_string()]);
}

#[test]
fn force_reload_reconstructs_instance_state() {
    let script = write_script(COUNTER_SCRIPT);
    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    for _ in 0..3 {
        scripts.run_frame(&mut world, 0.016);
    }
    assert_eq!(world.position(handle), Some(Vector3::new(3.0, 0.0, 0.0)));

    scripts.force_reload().expect("reload");
    assert_eq!(scripts.phase(handle), Some(InstancePhase::Constructed));
    scripts.run_frame(&mut world, 0.016);
    assert_eq!(world.position(handle), Some(Vector3::new(1.0, 0.0, 0.0)), "state restarts");
}

#[test]
fn reads_observe_writes_from_the_same_update() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                entity.position = vec3(1.0, 2.0, 3.0);
                let p = entity.position;
                log(p.to_string());
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    scripts.run_frame(&mut world, 0.016);
    assert_eq!(scripts.take_logs(), vec!["vec3(1, 2, 3)".to_string()]);
}

#[test]
fn transform_view_is_readable_from_scripts() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                let t = entity.get_transform();
                log(t.position.to_string());
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::new(7.0, 8.0, 9.0));
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    scripts.run_frame(&mut world, 0.016);
    assert_eq!(scripts.take_logs(), vec!["vec3(7, 8, 9)".to_string()]);
}

#[test]
fn detach_takes_effect_at_the_frame_boundary() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                log("ran");
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    scripts.run_frame(&mut world, 0.016);
    assert_eq!(scripts.take_logs(), vec!["ran".to_string()]);

    scripts.detach(handle);
    assert!(scripts.is_attached(handle), "detach is deferred, not immediate");

    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.updated, 0);
    assert!(scripts.take_logs().is_empty(), "detached instance must not run");
    assert!(!scripts.is_attached(handle));
    assert_eq!(scripts.instance_count(), 0);
}

#[test]
fn disabled_host_skips_scheduling() {
    let script = write_script(
        r#"
            fn update(dt, entity) {
                log("ran");
            }
        "#,
    );

    let mut world = HostWorld::new();
    let handle = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(handle, script.path()).expect("attach");

    scripts.set_enabled(false);
    assert!(!scripts.enabled());
    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.updated, 0);
    assert!(scripts.take_logs().is_empty());

    scripts.set_enabled(true);
    let report = scripts.run_frame(&mut world, 0.016);
    assert_eq!(report.updated, 1);
    assert_eq!(scripts.take_logs(), vec!["ran".to_string()]);
}

#[test]
fn instances_keep_independent_state() {
    let script = write_script(COUNTER_SCRIPT);
    let mut world = HostWorld::new();
    let first = world.spawn_at(Vector3::ZERO);
    let mut scripts = ScriptHost::new();
    scripts.attach(first, script.path()).expect("attach first");

    scripts.run_frame(&mut world, 0.016);
    scripts.run_frame(&mut world, 0.016);

    let second = world.spawn_at(Vector3::ZERO);
    scripts.attach(second, script.path()).expect("attach second");
    scripts.run_frame(&mut world, 0.016);

    assert_eq!(scripts.instance_count(), 2);
    assert_eq!(world.position(first), Some(Vector3::new(3.0, 0.0, 0.0)));
    assert_eq!(world.position(second), Some(Vector3::new(1.0, 0.0, 0.0)));
}
