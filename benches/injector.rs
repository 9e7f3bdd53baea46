use criterion::{criterion_group, criterion_main, Criterion};
use molecula::{Injector, Molecule, ScopeKey};

fn criterion_benchmark(c: &mut Criterion) {
    let user = ScopeKey::new("user", 0u32);
    let company = ScopeKey::new("company", "example.com");

    let config = Molecule::new("config", |_| Ok(()));
    let per_user = Molecule::new("per user", {
        let user = user.clone();
        let config = config.clone();
        move |getter| Ok((getter.inject(&user)?, getter.inject(&config)?))
    });
    let membership = Molecule::new("membership", {
        let company = company.clone();
        let per_user = per_user.clone();
        move |getter| Ok((getter.inject(&company)?, getter.inject(&per_user)?))
    });

    c.bench_function("injector_get_unscoped_cached", |b| {
        let injector = Injector::default();
        let (_, unsubscribe) = injector.use_molecule(&config, &[]).unwrap();
        b.iter(|| {
            let (_, unsubscribe) = injector.use_molecule(&config, &[]).unwrap();
            unsubscribe.call().unwrap();
        });
        unsubscribe.call().unwrap();
    })
    .bench_function("injector_get_scoped_cached", |b| {
        let injector = Injector::default();
        let tuples = [user.tuple(1), company.tuple("foo.example.com")];
        let (_, unsubscribe) = injector.use_molecule(&membership, &tuples).unwrap();
        b.iter(|| {
            let (_, unsubscribe) = injector.use_molecule(&membership, &tuples).unwrap();
            unsubscribe.call().unwrap();
        });
        unsubscribe.call().unwrap();
    })
    .bench_function("injector_use_and_release", |b| {
        let injector = Injector::default();
        let tuples = [user.tuple(1), company.tuple("foo.example.com")];
        b.iter(|| {
            let (_, unsubscribe) = injector.use_molecule(&membership, &tuples).unwrap();
            unsubscribe.call().unwrap();
        });
    })
    .bench_function("injector_use_scopes_churn", |b| {
        let injector = Injector::default();
        b.iter(|| {
            let (_, unsubscribe) = injector.use_scopes(&[user.tuple(1), company.tuple("foo.example.com")]).unwrap();
            unsubscribe.call().unwrap();
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
