use std::sync::Arc;

use cinder_dbt::cache::CacheStats;
use cinder_dbt::profile::NoProfile;
use cinder_dbt::{
    CacheError, CodeCache, HostCodeGenerator, IrEvaluator, Trace, TraceBuilder, TranslateError,
    TranslatorConfig,
};
use cinder_refisa::asm::{self, assemble, R0, R1};
use cinder_refisa::{RefIsa, RefMachine};

fn program() -> RefMachine {
    let image = assemble(&[
        asm::movi(R1, 3),
        asm::addi(R1, R1, -1),
        asm::bnz(-4),
        asm::movi(R0, 0),
        asm::syscall(),
    ]);
    RefMachine::with_image(0x100, 0, &image).unwrap()
}

fn compiled_trace(pc: u64) -> Arc<Trace> {
    let arch = RefIsa::new();
    let m = program();
    let config = TranslatorConfig::default();
    let built = TraceBuilder::new(&arch, &m, &NoProfile, &config)
        .build(pc)
        .unwrap();
    let generated = IrEvaluator::new().generate(&built).unwrap();
    Arc::new(Trace::new(pc, built.instruction_count, generated))
}

#[test]
fn duplicate_add_is_rejected_and_keeps_the_first_trace() {
    let cache = CodeCache::new();
    let first = compiled_trace(0);
    let second = compiled_trace(0);

    cache.add(Arc::clone(&first)).unwrap();
    assert_eq!(
        cache.add(second),
        Err(CacheError::DuplicateEntry { pc: 0 })
    );
    assert!(Arc::ptr_eq(&cache.try_get(0).unwrap(), &first));
    assert_eq!(cache.len(), 1);
}

#[test]
fn publish_adopts_the_earlier_trace() {
    let cache = CodeCache::new();
    let winner = compiled_trace(4);
    let loser = compiled_trace(4);

    assert!(Arc::ptr_eq(&cache.publish(Arc::clone(&winner)), &winner));
    assert!(Arc::ptr_eq(&cache.publish(loser), &winner));
    assert_eq!(cache.stats().lost_races, 1);
    assert_eq!(cache.entries(), vec![4]);
}

#[test]
fn second_compile_is_served_from_the_cache() {
    let arch = Arc::new(RefIsa::new());
    let translator = cinder_refisa::translator(
        Arc::clone(&arch),
        Arc::new(NoProfile),
        TranslatorConfig::default(),
    );
    let m = program();

    let first = translator.compile(0, &m).unwrap();
    let decoded = arch.decode_count();
    let second = translator.compile(0, &m).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(arch.decode_count(), decoded);
    assert_eq!(
        translator.cache().stats(),
        CacheStats {
            hits: 1,
            misses: 1,
            lost_races: 0
        }
    );
}

#[test]
fn precompile_refuses_to_overwrite() {
    let translator = cinder_refisa::translator(
        Arc::new(RefIsa::new()),
        Arc::new(NoProfile),
        TranslatorConfig::default(),
    );
    let m = program();
    translator.precompile(0, &m).unwrap();
    let err = translator.precompile(0, &m).unwrap_err();
    assert_eq!(
        err,
        TranslateError::Cache(CacheError::DuplicateEntry { pc: 0 })
    );
}

#[test]
fn racing_compilations_publish_exactly_one_trace() {
    const CONTEXTS: usize = 8;

    let translator = cinder_refisa::translator(
        Arc::new(RefIsa::new()),
        Arc::new(NoProfile),
        TranslatorConfig::default(),
    );
    let m = program();

    let traces: Vec<Arc<Trace>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..CONTEXTS)
            .map(|_| s.spawn(|| translator.compile(0, &m).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let cached = translator.cache().try_get(0).unwrap();
    assert!(traces.iter().all(|t| Arc::ptr_eq(t, &cached)));
    assert_eq!(translator.cache().len(), 1);

    // Every context that missed built a trace; all but one of them lost the race.
    let stats = translator.cache().stats();
    assert_eq!(stats.hits + stats.misses, CONTEXTS as u64 + 1);
    assert_eq!(stats.lost_races, stats.misses - 1);
}
