//! End-to-end behavior of the master: lifecycles, crash recovery and monitors

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use widgetmaster::args;
use widgetmaster::error::ErrorCode;
use widgetmaster::instance::{GbarState, InstanceState};
use widgetmaster::master::{Master, Peer};
use widgetmaster::protocol::{Args, PacketKind, Target};
use widgetmaster::queue::Command;
use widgetmaster::store::PackageInfo;
use widgetmaster::timer::TimerEvent;
use widgetmaster::{ReactorEvent, WmResult};

// =============================================================================
// Instance lifecycle and self-healing
// =============================================================================

#[test]
fn test_unowned_instance_recreated_after_worker_crash() {
    let (mut m, launches) = master_with(vec![clock()]);
    let key = m.create_instance(&unowned("clock", 1.0)).unwrap();
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    assert_eq!(m.slaves.find_by_name(&slave).unwrap().queue.len(), 1, "new is queued until hello");

    let mut worker = attach_worker(&mut m, 1, &slave);
    let seen = serve_worker(&mut m, &mut worker);
    assert!(cmds(&seen).contains(&"new"));

    let inst = m.instances.find_instance(&key.0, &key.1).unwrap();
    assert_eq!(inst.state, InstanceState::Active);
    assert!(inst.dbox.is_allocated());
    assert_eq!(inst.dbox.size(), (172, 172));

    m.handle_event(ReactorEvent::Disconnected { conn: 1 });

    let inst = m.instances.find_instance(&key.0, &key.1).expect("instance survives the crash");
    assert_eq!(inst.state, InstanceState::Created);
    assert_eq!(inst.attempt, 2);
    assert_eq!(inst.period, 60.0);
    assert!(!inst.dbox.is_allocated());
    assert_eq!(launches.lock().unwrap().launched.len(), 2, "replacement worker launched");

    let replacement = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 2, &replacement);
    let seen = serve_worker(&mut m, &mut worker);
    assert_eq!(cmds(&seen).iter().filter(|c| **c == "new").count(), 1);
    assert_eq!(m.instances.find_instance(&key.0, &key.1).unwrap().state, InstanceState::Active);
}

#[test]
fn test_crash_deletes_owned_and_recreates_unowned() {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    viewer_new(&mut m, &mut viewer, "clock", 1.0);
    viewer_new(&mut m, &mut viewer, "clock", 2.0);
    let unowned_key = m.create_instance(&unowned("clock", 3.0)).unwrap();

    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);
    assert_eq!(m.instances.instances_of("clock").len(), 3);
    viewer.drain();

    m.handle_event(ReactorEvent::Disconnected { conn: 1 });

    let deleted: Vec<_> = viewer.drain().into_iter().filter(|p| p.cmd == "deleted").collect();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.iter().all(|p| p.args.i32(2).unwrap() == ErrorCode::Fault.code()));
    assert_eq!(m.instances.instances_of("clock"), vec![unowned_key]);

    let replacement = m.instances.slave_of("clock").unwrap().to_string();
    let queued = &m.slaves.find_by_name(&replacement).unwrap().queue;
    assert_eq!(queued.len(), 1, "one recreate request");
}

#[test]
fn test_crash_with_only_owned_instances_unbinds_package() {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    viewer_new(&mut m, &mut viewer, "clock", 1.0);
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);

    m.handle_event(ReactorEvent::Disconnected { conn: 1 });

    assert!(m.instances.instances_of("clock").is_empty());
    assert!(m.instances.slave_of("clock").is_none());
    assert_eq!(m.slaves.find_by_name(&slave).unwrap().fault_count, 1);
}

#[test]
fn test_viewer_release_deletes_its_instances() {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    viewer_new(&mut m, &mut viewer, "clock", 1.0);
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);

    m.handle_event(ReactorEvent::Disconnected { conn: 10 });

    assert!(m.instances.instances_of("clock").is_empty());
    assert!(m.clients.find_by_pid(900).is_none());
    let sent = worker.drain();
    assert!(cmds(&sent).contains(&"delete"));
    assert_eq!(m.slaves.find_by_name(&slave).unwrap().refcnt(), 0);
}

#[test]
fn test_repeated_worker_fault_disables_packages() {
    let (mut m, _) = master_with(vec![clock()]);
    m.create_instance(&unowned("clock", 1.0)).unwrap();

    for conn in 1..=3 {
        let Some(slave) = m.instances.slave_of("clock").map(str::to_string) else {
            break;
        };
        let mut worker = attach_worker(&mut m, conn, &slave);
        serve_worker(&mut m, &mut worker);
        m.handle_event(ReactorEvent::Disconnected { conn });
    }

    assert!(m.instances.is_fault("clock"));
    assert!(m.instances.instances_of("clock").is_empty());
    assert!(m.slaves.is_empty(), "worker destroyed after max faults");
}

#[test]
fn test_open_call_faults_package() {
    let (mut m, _) = master_with(vec![clock()]);
    let key = m.create_instance(&unowned("clock", 1.0)).unwrap();
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);

    worker.notify(&mut m, "call", args!["clock", key.1.as_str(), "update"]);
    m.handle_event(ReactorEvent::Disconnected { conn: 1 });

    let package = m.instances.find_package("clock").unwrap();
    assert!(package.is_fault());
    assert_eq!(package.fault.as_ref().unwrap().func, "update");
    assert!(m.instances.instances_of("clock").is_empty(), "faulted packages are not recreated");
}

#[test]
fn test_deliberate_teardown_deletes_without_recreate() {
    let (mut m, launches) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    viewer_new(&mut m, &mut viewer, "clock", 1.0);
    m.create_instance(&unowned("clock", 2.0)).unwrap();
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);
    viewer.drain();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    m.push_command(
        Peer::Slave(slave.clone()),
        Command::request(
            "stats",
            args![],
            Box::new(move |_: &mut Master, res: WmResult<Args>| {
                *seen.lock().unwrap() = Some(res.map(|_| ()));
            }),
        ),
    );
    assert_eq!(cmds(&worker.drain()), vec!["stats"]);

    m.destroy_slave(&slave);

    assert!(m.instances.instances_of("clock").is_empty());
    assert!(m.instances.slave_of("clock").is_none());
    assert!(m.slaves.find_by_name(&slave).is_none());
    assert_eq!(*outcome.lock().unwrap(), Some(Err(ErrorCode::Fault)));

    let log = launches.lock().unwrap();
    assert_eq!(log.launched, vec![slave.clone()], "nothing relaunched for a recreate");
    assert_eq!(log.killed, vec![(slave.clone(), 7001)]);

    let deleted: Vec<_> = viewer.drain().into_iter().filter(|p| p.cmd == "deleted").collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].args.i32(2).unwrap(), 0);
}

#[test]
fn test_commands_for_faulted_package_are_dropped() {
    let (mut m, _) = master_with(vec![clock()]);
    m.slaves.create("slave.q", false, "c");
    m.instances.create_package("clock").unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let peer = Peer::Slave("slave.q".to_string());
    m.push_command(
        peer.clone(),
        Command::request(
            "update",
            args!["clock"],
            Box::new(move |_: &mut Master, res: WmResult<Args>| {
                *seen.lock().unwrap() = Some(res.map(|_| ()));
            }),
        )
        .for_instance("clock", None),
    );
    m.push_command(peer, Command::notify("update", args!["weather"]).for_instance("weather", None));
    m.instances.set_fault("clock", "clock.so", "update").unwrap();

    let mut worker = attach_worker(&mut m, 1, "slave.q");
    let sent = worker.drain();
    assert_eq!(cmds(&sent), vec!["pause", "update"]);
    assert_eq!(sent[1].args.str(0).unwrap(), "weather");
    assert_eq!(*outcome.lock().unwrap(), Some(Err(ErrorCode::Fault)));
}

// =============================================================================
// Registries
// =============================================================================

#[test]
fn test_exclusive_worker_hosts_one_package() {
    let secured = PackageInfo {
        secured: true,
        ..PackageInfo::fallback("lock")
    };
    let (mut m, _) = master_with(vec![secured]);
    m.create_instance(&unowned("lock", 1.0)).unwrap();
    m.create_instance(&unowned("lock", 2.0)).unwrap();

    assert_eq!(m.instances.slave_of("lock"), Some("lock"));
    assert_eq!(m.slaves.find_by_name("lock").unwrap().refcnt(), 1);
    assert_eq!(m.slaves.ref_slave("lock"), Err(ErrorCode::InvalidState));
}

#[test]
fn test_fault_record_and_activation() {
    let (mut m, _) = master_with(vec![clock()]);
    m.create_instance(&unowned("clock", 1.0)).unwrap();
    assert_eq!(m.activate_package("clock"), Err(ErrorCode::InvalidState));

    m.fault_package("clock", "clock.js", "update").unwrap();
    assert!(m.instances.is_fault("clock"));
    assert!(m.instances.find_package("clock").unwrap().fault.is_some());
    assert!(m.instances.instances_of("clock").is_empty());
    assert_eq!(m.create_instance(&unowned("clock", 2.0)).err(), Some(ErrorCode::Fault));

    m.activate_package("clock").unwrap();
    assert!(!m.instances.is_fault("clock"));
    assert!(m.create_instance(&unowned("clock", 2.0)).is_ok());
}

#[test]
fn test_viewer_pause_propagates_to_workers() {
    let (mut m, _) = master_with(vec![clock()]);
    m.create_instance(&unowned("clock", 1.0)).unwrap();
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    let first = serve_worker(&mut m, &mut worker);
    assert_eq!(first[0].cmd, "pause", "no viewers yet, worker starts paused");

    let mut viewer = acquire_viewer(&mut m, 10, 900);
    assert_eq!(cmds(&worker.drain()), vec!["resume"]);

    viewer.request(&mut m, "pause", args![]);
    assert_eq!(cmds(&worker.drain()), vec!["pause"]);
    assert!(m.all_paused());
}

// =============================================================================
// Buffers
// =============================================================================

#[test]
fn test_buffer_acquire_twice_and_viewer_refs() {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    let (pkg, id) = viewer_new(&mut m, &mut viewer, "clock", 1.0);
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);

    let first = worker.request(&mut m, "acquireBuffer", args!["dbox", pkg.as_str(), id.as_str(), 0, 0]);
    let second = worker.request(&mut m, "acquireBuffer", args!["dbox", pkg.as_str(), id.as_str(), 0, 0]);
    let resource = first.str(1).unwrap().to_string();
    assert_eq!(second.str(1).unwrap(), resource);

    let pixmap = viewer.request(&mut m, "acquirePixmap", args!["dbox", pkg.as_str(), id.as_str()]);
    assert_eq!(pixmap.str(1).unwrap(), resource);

    // activation plus two acquires
    for _ in 0..3 {
        let reply = worker.request(&mut m, "releaseBuffer", args!["dbox", pkg.as_str(), id.as_str()]);
        assert_eq!(reply.ret(), 0);
    }
    assert!(m.buffers.is_loaded(&resource), "viewer still holds it");

    viewer.request(&mut m, "releasePixmap", args![pkg.as_str(), id.as_str(), resource.as_str()]);
    assert!(!m.buffers.is_loaded(&resource));
}

#[test]
fn test_buffer_requests_from_other_worker_are_rejected() {
    let (mut m, _) = master_with(vec![clock()]);
    let (pkg, id) = m.create_instance(&unowned("clock", 1.0)).unwrap();
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);

    let mut stranger = attach_worker(&mut m, 2, "slave.other");
    let reply = stranger.request(&mut m, "acquireBuffer", args!["dbox", pkg.as_str(), id.as_str(), 10, 10]);
    assert_eq!(reply.ret(), ErrorCode::PermissionDenied.code());

    let reply = worker.request(&mut m, "acquireBuffer", args!["dbox", "clock", "missing", 10, 10]);
    assert_eq!(reply.ret(), ErrorCode::NotExist.code());
}

#[test]
fn test_worker_resizes_detail_surface() {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    let (pkg, id) = viewer_new(&mut m, &mut viewer, "clock", 1.0);
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);
    viewer.drain();

    let acquired = worker.request(&mut m, "acquireBuffer", args!["detail", pkg.as_str(), id.as_str(), 360, 240]);
    assert_eq!(acquired.ret(), 0);
    let reply = worker.request(&mut m, "resizeBuffer", args!["detail", pkg.as_str(), id.as_str(), 100, 100]);
    assert_eq!(reply.ret(), 0);
    assert!(!reply.str(1).unwrap().is_empty());
    assert_eq!(m.instances.find_instance(&pkg, &id).unwrap().gbar.size(), (100, 100));

    let changed = viewer.drain().into_iter().find(|p| p.cmd == "bufferChanged").unwrap();
    assert_eq!(changed.args.str(0).unwrap(), Target::Gbar.as_str());
}

// =============================================================================
// Monitors
// =============================================================================

fn active_owned_instance() -> (widgetmaster::Master, Endpoint, Endpoint, (String, String)) {
    let (mut m, _) = master_with(vec![clock()]);
    let mut viewer = acquire_viewer(&mut m, 10, 900);
    let key = viewer_new(&mut m, &mut viewer, "clock", 1.0);
    let slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut worker = attach_worker(&mut m, 1, &slave);
    serve_worker(&mut m, &mut worker);
    viewer.drain();
    (m, viewer, worker, key)
}

#[test]
fn test_close_while_open_pending_cancels_open() {
    let (mut m, mut viewer, mut worker, (pkg, id)) = active_owned_instance();

    let reply = viewer.request(&mut m, "createDetail", args![pkg.as_str(), id.as_str(), 0.5, 0.5]);
    assert_eq!(reply.ret(), 0);
    let shown = serve_worker(&mut m, &mut worker);
    assert_eq!(cmds(&shown), vec!["gbar_show"]);
    assert_eq!(m.instances.find_instance(&pkg, &id).unwrap().gbar_state, GbarState::Opening);

    let reply = viewer.request(&mut m, "destroyDetail", args![pkg.as_str(), id.as_str()]);
    assert_eq!(reply.ret(), 0);
    let hidden = serve_worker(&mut m, &mut worker);
    assert_eq!(cmds(&hidden), vec!["gbar_hide"]);

    let events: Vec<_> = viewer.drain().into_iter().filter(|p| p.kind == PacketKind::Notify).collect();
    assert_eq!(cmds(&events), vec!["gbarCreated", "gbarDestroyed"]);
    assert_eq!(events[0].args.i32(2).unwrap(), ErrorCode::Canceled.code());
    assert_eq!(events[1].args.i32(2).unwrap(), 0);

    let inst = m.instances.find_instance(&pkg, &id).unwrap();
    assert_eq!(inst.gbar_state, GbarState::Closed);
    assert!(inst.monitor.is_none());
    assert!(m.timers.find(|e| matches!(e, TimerEvent::Monitor { .. })).is_none());
}

#[test]
fn test_detail_opens_on_first_content() {
    let (mut m, mut viewer, mut worker, (pkg, id)) = active_owned_instance();

    viewer.request(&mut m, "createDetail", args![pkg.as_str(), id.as_str(), 0.0, 0.0]);
    serve_worker(&mut m, &mut worker);
    worker.notify(&mut m, "gbarUpdated", args![pkg.as_str(), id.as_str(), "", 0, 0, 360, 240]);

    let events = viewer.drain();
    let created = events.iter().find(|p| p.cmd == "gbarCreated").unwrap();
    assert_eq!(created.args.i32(2).unwrap(), 0);
    assert_eq!(m.instances.find_instance(&pkg, &id).unwrap().gbar_state, GbarState::Open);
    assert_eq!(
        viewer.request(&mut m, "createDetail", args![pkg.as_str(), id.as_str(), 0.0, 0.0]).ret(),
        ErrorCode::Already.code()
    );
}

#[test]
fn test_resize_without_reply_times_out() {
    let (mut m, mut viewer, mut worker, (pkg, id)) = active_owned_instance();

    let reply = viewer.request(&mut m, "resize", args![pkg.as_str(), id.as_str(), 200, 200]);
    assert_eq!(reply.ret(), 0);
    let request = worker.drain().into_iter().find(|p| p.cmd == "resize").unwrap();

    let timer = m
        .timers
        .find(|e| matches!(e, TimerEvent::Monitor { .. }))
        .expect("resize monitor armed");
    m.handle_event(ReactorEvent::Timer { id: timer });

    let changed = viewer.drain().into_iter().find(|p| p.cmd == "sizeChanged").unwrap();
    assert_eq!(changed.args.str(0).unwrap(), Target::Dbox.as_str());
    assert_eq!(changed.args.i32(3).unwrap(), ErrorCode::Timeout.code());
    assert_eq!(m.instances.find_instance(&pkg, &id).unwrap().dbox.size(), (172, 172));

    // a late reply finds no pending monitor
    m.handle_event(ReactorEvent::Packet {
        conn: worker.conn,
        packet: request.reply(args![0]),
    });
    assert!(viewer.drain().iter().all(|p| p.cmd != "sizeChanged"));
}

#[test]
fn test_resize_completes_with_new_size() {
    let (mut m, mut viewer, mut worker, (pkg, id)) = active_owned_instance();

    viewer.request(&mut m, "resize", args![pkg.as_str(), id.as_str(), 200, 100]);
    serve_worker(&mut m, &mut worker);

    let changed = viewer.drain().into_iter().find(|p| p.cmd == "sizeChanged").unwrap();
    assert_eq!(changed.args.i32(3).unwrap(), 0);
    assert_eq!((changed.args.i32(4).unwrap(), changed.args.i32(5).unwrap()), (200, 100));
    assert_eq!(m.instances.find_instance(&pkg, &id).unwrap().dbox.size(), (200, 100));
}

#[test]
fn test_worker_crash_fails_pending_monitor() {
    let (mut m, mut viewer, mut worker, (pkg, id)) = active_owned_instance();

    viewer.request(&mut m, "createDetail", args![pkg.as_str(), id.as_str(), 0.0, 0.0]);
    serve_worker(&mut m, &mut worker);
    m.handle_event(ReactorEvent::Disconnected { conn: worker.conn });

    let events = viewer.drain();
    let created = events.iter().find(|p| p.cmd == "gbarCreated").unwrap();
    assert_eq!(created.args.i32(2).unwrap(), ErrorCode::Fault.code());
    assert!(m.slave_hooks.is_empty(), "monitor hook unsubscribed");
}

// =============================================================================
// Service channel
// =============================================================================

#[test]
fn test_bulk_update_reaches_every_instance_before_failing() {
    let (mut m, _) = master_with(vec![clock()]);
    m.create_instance(&unowned("alarm", 1.0)).unwrap();
    m.create_instance(&unowned("clock", 1.0)).unwrap();
    let alarm_slave = m.instances.slave_of("alarm").unwrap().to_string();
    let clock_slave = m.instances.slave_of("clock").unwrap().to_string();
    let mut workers = vec![attach_worker(&mut m, 1, &alarm_slave)];
    if clock_slave != alarm_slave {
        workers.push(attach_worker(&mut m, 2, &clock_slave));
    }
    for worker in &mut workers {
        serve_worker(&mut m, worker);
    }

    // alarm sorts first and can no longer be forwarded
    m.instances.package_mut("alarm").unwrap().slave = None;
    let mut service = connect(&mut m, widgetmaster::protocol::Channel::Service, 60, 1);
    let reply = service.request(&mut m, "update", args!["", "", "", 1]);
    assert_eq!(reply.ret(), ErrorCode::Fault.code());

    let updates: Vec<_> = workers
        .iter_mut()
        .flat_map(|w| w.drain())
        .filter(|p| p.cmd == "update_content")
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].args.str(0).unwrap(), "clock");
}

// =============================================================================
// Debug channel
// =============================================================================

#[test]
fn test_debug_listings() {
    let (mut m, _) = master_with(vec![clock()]);
    m.create_instance(&unowned("clock", 1.0)).unwrap();
    let mut debug = connect(&mut m, widgetmaster::protocol::Channel::Debug, 50, 1);

    let reply = debug.request(&mut m, "instList", args!["clock"]);
    let rows = widgetmaster::ipc::parse_listing(reply.str(1).unwrap()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["pkg"], "clock");

    let reply = debug.request(&mut m, "pkgCtrl", args!["rmpack", "clock"]);
    assert_eq!(reply.ret(), 0);
    let reply = debug.request(&mut m, "pkgList", args![]);
    assert_eq!(reply.str(1).unwrap(), "EOD\n");

    let reply = debug.request(&mut m, "masterCtrl", args!["set", "gbar-timeout", 1500]);
    assert_eq!(reply.i32(1).unwrap(), 1500);
    assert_eq!(m.tunables.gbar_timeout, std::time::Duration::from_millis(1500));
}
