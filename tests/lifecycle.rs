use molecula::{Getter, Injector, InstantiateErrorKind, LifecycleErrorKind, Molecule, ResolveErrorKind, ScopeKey, Unmount};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::debug;
use tracing_test::traced_test;

type Events = Arc<Mutex<Vec<String>>>;

/// Wraps `factory` so every instance records its mount and unmount in `events`.
fn mounted<T, F>(name: &'static str, events: &Events, mut factory: F) -> Molecule<T>
where
    T: Send + Sync + 'static,
    F: FnMut(&Getter) -> Result<T, InstantiateErrorKind> + Clone + Send + Sync + 'static,
{
    let events = events.clone();
    Molecule::new(name, move |getter| {
        let events = events.clone();
        getter.on_mount(move || {
            events.lock().push(format!("mount {name}"));
            debug!("Mount called");

            let events = events.clone();
            Some(Box::new(move || {
                events.lock().push(format!("unmount {name}"));
                debug!("Unmount called");
            }) as Unmount)
        })?;
        factory(getter)
    })
}

fn taken(events: &Events) -> Vec<String> {
    std::mem::take(&mut *events.lock())
}

#[test]
#[traced_test]
fn test_mount_and_unmount_once_across_overlapping_uses() {
    let events = Events::default();
    let user = ScopeKey::new("user", 0u32);
    let per_user = mounted("per user", &events, {
        let user = user.clone();
        move |getter| Ok(getter.inject(&user)?)
    });

    let injector = Injector::default();
    let (first, first_unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();
    let (second, second_unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();
    let (third, third_unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(taken(&events), ["mount per user"]);

    first_unsubscribe.call().unwrap();
    second_unsubscribe.call().unwrap();
    assert!(taken(&events).is_empty());

    third_unsubscribe.call().unwrap();
    assert_eq!(taken(&events), ["unmount per user"]);
}

#[test]
#[traced_test]
fn test_released_instance_is_recreated() {
    let call_count = Arc::new(AtomicU8::new(0));
    let events = Events::default();
    let counter = mounted("counter", &events, {
        let call_count = call_count.clone();
        move |_| Ok(call_count.fetch_add(1, Ordering::SeqCst))
    });

    let injector = Injector::default();
    let (first, unsubscribe) = injector.use_molecule(&counter, &[]).unwrap();
    unsubscribe.call().unwrap();
    let (second, unsubscribe) = injector.use_molecule(&counter, &[]).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!((*first, *second), (0, 1));
    assert_eq!(taken(&events), ["mount counter", "unmount counter", "mount counter"]);
    unsubscribe.call().unwrap();
}

#[test]
#[traced_test]
fn test_dependencies_mount_first_and_unmount_last() {
    let events = Events::default();
    let top = mounted("top", &events, |_| Ok(()));
    let middle = mounted("middle", &events, {
        let top = top.clone();
        move |getter| getter.inject(&top).map_err(Into::into)
    });
    let bottom = mounted("bottom", &events, {
        let middle = middle.clone();
        move |getter| getter.inject(&middle).map_err(Into::into)
    });

    let injector = Injector::default();
    let (_, unsubscribe) = injector.use_molecule(&bottom, &[]).unwrap();
    assert_eq!(taken(&events), ["mount top", "mount middle", "mount bottom"]);

    unsubscribe.call().unwrap();
    assert_eq!(taken(&events), ["unmount bottom", "unmount middle", "unmount top"]);
}

#[test]
#[traced_test]
fn test_diamond_mounts_top_once() {
    let events = Events::default();
    let top = mounted("top", &events, |_| Ok(()));
    let left = mounted("left", &events, {
        let top = top.clone();
        move |getter| getter.inject(&top).map_err(Into::into)
    });
    let right = mounted("right", &events, {
        let top = top.clone();
        move |getter| getter.inject(&top).map_err(Into::into)
    });
    let bottom = mounted("bottom", &events, {
        let left = left.clone();
        let right = right.clone();
        move |getter| Ok((getter.inject(&left)?, getter.inject(&right)?))
    });

    let injector = Injector::default();
    let (value, unsubscribe) = injector.use_molecule(&bottom, &[]).unwrap();
    assert!(Arc::ptr_eq(&*value.0, &*value.1));
    assert_eq!(taken(&events), ["mount top", "mount left", "mount right", "mount bottom"]);

    unsubscribe.call().unwrap();
    assert_eq!(
        taken(&events),
        ["unmount bottom", "unmount right", "unmount left", "unmount top"]
    );
}

#[test]
#[traced_test]
fn test_shared_dependency_outlives_one_dependent() {
    let events = Events::default();
    let user = ScopeKey::new("user", 0u32);
    let shared = mounted("shared", &events, |_| Ok(()));
    let per_user = mounted("per user", &events, {
        let user = user.clone();
        let shared = shared.clone();
        move |getter| Ok((getter.inject(&user)?, getter.inject(&shared)?))
    });

    let injector = Injector::default();
    let (_, keep_shared) = injector.use_molecule(&shared, &[]).unwrap();
    let (_, unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();
    assert_eq!(taken(&events), ["mount shared", "mount per user"]);

    unsubscribe.call().unwrap();
    assert_eq!(taken(&events), ["unmount per user"]);

    keep_shared.call().unwrap();
    assert_eq!(taken(&events), ["unmount shared"]);
}

#[test]
#[traced_test]
fn test_unmount_callbacks_run_in_reverse() {
    let events = Events::default();
    let molecule = Molecule::new("resources", {
        let events = events.clone();
        move |getter| {
            for resource in ["connection", "session"] {
                let events = events.clone();
                getter.on_unmount(move || events.lock().push(format!("close {resource}")))?;
            }
            Ok(())
        }
    });

    let injector = Injector::default();
    let (_, unsubscribe) = injector.use_molecule(&molecule, &[]).unwrap();
    assert!(taken(&events).is_empty());

    unsubscribe.call().unwrap();
    assert_eq!(taken(&events), ["close session", "close connection"]);
}

#[test]
#[traced_test]
fn test_lazy_mounts_on_start() {
    let events = Events::default();
    let user = ScopeKey::new("user", 0u32);
    let per_user = mounted("per user", &events, {
        let user = user.clone();
        move |getter| Ok(getter.inject(&user)?)
    });

    let injector = Injector::default();
    let lazy = injector.use_lazily(&per_user, &[user.tuple(1)]).unwrap();
    assert_eq!(**lazy.value(), 1);
    assert!(taken(&events).is_empty());

    let value = lazy.start().unwrap();
    assert!(Arc::ptr_eq(&value, lazy.value()));
    assert!(lazy.subscription().is_active());
    assert_eq!(taken(&events), ["mount per user"]);

    assert!(matches!(
        lazy.start(),
        Err(ResolveErrorKind::Lifecycle(LifecycleErrorKind::AlreadyStarted))
    ));

    lazy.stop().unwrap();
    assert_eq!(taken(&events), ["unmount per user"]);
    assert_eq!(lazy.stop(), Err(LifecycleErrorKind::AlreadyStopped));
}

#[test]
#[traced_test]
fn test_lazy_stopped_before_start() {
    let call_count = Arc::new(AtomicU8::new(0));
    let events = Events::default();
    let counter = mounted("counter", &events, {
        let call_count = call_count.clone();
        move |_| Ok(call_count.fetch_add(1, Ordering::SeqCst))
    });

    let injector = Injector::default();
    let lazy = injector.use_lazily(&counter, &[]).unwrap();
    lazy.stop().unwrap();

    assert!(taken(&events).is_empty());
    assert!(matches!(
        lazy.start(),
        Err(ResolveErrorKind::Lifecycle(LifecycleErrorKind::AlreadyStopped))
    ));

    let value = injector.get(&counter, &[]).unwrap();
    assert_eq!(*value, 1);
    assert_eq!(call_count.load(Ordering::SeqCst), 2);
}

#[test]
#[traced_test]
fn test_each_scope_value_mounts_separately() {
    let events = Events::default();
    let user = ScopeKey::new("user", 0u32);
    let per_user = mounted("per user", &events, {
        let user = user.clone();
        move |getter| Ok(getter.inject(&user)?)
    });

    let injector = Injector::default();
    let (_, first) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();
    let (_, second) = injector.use_molecule(&per_user, &[user.tuple(2)]).unwrap();
    assert_eq!(taken(&events), ["mount per user", "mount per user"]);

    first.call().unwrap();
    assert_eq!(taken(&events), ["unmount per user"]);
    second.call().unwrap();
    assert_eq!(taken(&events), ["unmount per user"]);
}

#[test]
#[traced_test]
fn test_explicit_subscription() {
    let user = ScopeKey::new("user", 0u32);
    let injector = Injector::default();

    let subscription = injector.create_subscription();
    let expanded = subscription.expand(&[user.tuple(1), user.tuple(2)]).unwrap();
    assert_eq!(expanded.len(), 2);
    assert_eq!(subscription.tuples().len(), 2);

    let (leased, unsubscribe) = injector.use_scopes(&[user.tuple(2)]).unwrap();
    assert!(molecula::ScopeTuple::ptr_eq(&leased[0], &expanded[1]));

    subscription.start().unwrap();
    subscription.stop().unwrap();
    assert!(subscription.tuples().is_empty());
    unsubscribe.call().unwrap();
}
