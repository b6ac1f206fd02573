//! Property tests: batch-size totality, catalog exclusivity and resolution
//! determinism.

use evoplan_core::{
    resolve_global_batch_size, BatchTopology, Catalog, CheckpointProbe, OptionValue, PlanError, PlanResolver,
    PlanResult, RawOptions,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;

struct NoCheckpoints;

impl CheckpointProbe for NoCheckpoints {
    fn has_checkpoint(&self, _dir: &Path) -> PlanResult<bool> {
        Ok(false)
    }
}

fn topology() -> impl Strategy<Value = BatchTopology> {
    (1u64..=8, 1u64..=4, 1u64..=16, 1u64..=8, 1u64..=4, 1u64..=4, 1u64..=8).prop_map(
        |(micro, nodes, devices, tp, pp, cp, grad_acc)| BatchTopology {
            micro_batch_size: micro,
            num_nodes: nodes,
            devices_per_node: devices,
            tensor_parallel: tp,
            pipeline_parallel: pp,
            context_parallel: cp,
            grad_accumulation_steps: grad_acc,
        },
    )
}

fn option_entries() -> Vec<(String, OptionValue)> {
    vec![
        ("mock_data".to_string(), OptionValue::Bool(true)),
        ("model_size".to_string(), OptionValue::from("1b")),
        ("devices".to_string(), OptionValue::Int(8)),
        ("tensor_parallel_size".to_string(), OptionValue::Int(2)),
        ("lr".to_string(), OptionValue::Float(2e-4)),
        ("seed".to_string(), OptionValue::Int(42)),
        ("hidden_dropout".to_string(), OptionValue::Float(0.1)),
        ("gc_interval".to_string(), OptionValue::Int(10)),
        ("wandb_tags".to_string(), OptionValue::StrList(vec!["a".to_string(), "b".to_string()])),
        ("nsys_ranks".to_string(), OptionValue::IntList(vec![0, 3])),
    ]
}

proptest! {
    #[test]
    fn prop_batch_size_is_total_on_valid_topologies(topo in topology()) {
        let world = topo.num_nodes * topo.devices_per_node;
        let model_parallel = topo.tensor_parallel * topo.pipeline_parallel * topo.context_parallel;
        let result = resolve_global_batch_size(None, &topo);

        if world % model_parallel == 0 {
            let expected = topo.micro_batch_size * topo.grad_accumulation_steps * (world / model_parallel);
            prop_assert_eq!(result.unwrap(), expected);
        } else {
            let is_decomposition_error = matches!(
                result,
                Err(PlanError::NonIntegerParallelismDecomposition { .. })
            );
            prop_assert!(is_decomposition_error);
        }
    }

    #[test]
    fn prop_explicit_batch_size_is_untouched(topo in topology(), explicit in 1u64..100_000) {
        prop_assert_eq!(resolve_global_batch_size(Some(explicit), &topo).unwrap(), explicit);
    }

    #[test]
    fn prop_unknown_identifiers_never_resolve(identifier in "[a-z0-9_]{1,24}") {
        let catalog = Catalog::builtin();
        let known: BTreeSet<&str> = catalog.entries().iter().map(|e| e.size).collect();
        prop_assume!(!known.contains(identifier.as_str()));
        let is_unknown = matches!(
            catalog.lookup(&identifier),
            Err(PlanError::UnknownSizeIdentifier { .. })
        );
        prop_assert!(is_unknown);
    }

    #[test]
    fn prop_resolution_ignores_option_order(order in Just(option_entries()).prop_shuffle()) {
        let resolver = PlanResolver::new().with_probe(NoCheckpoints);
        let canonical = resolver.resolve(option_entries().into_iter().collect()).unwrap();
        let shuffled: RawOptions = order.into_iter().collect();
        let plan = resolver.resolve(shuffled).unwrap();

        prop_assert_eq!(plan.identity().as_str(), canonical.identity().as_str());
        prop_assert_eq!(plan, canonical);
    }
}

#[test]
fn test_every_catalog_identifier_has_one_family() {
    let catalog = Catalog::builtin();
    for entry in catalog.entries() {
        let found = catalog.lookup(entry.size).unwrap();
        assert_eq!(found.family, entry.family);
    }
}

#[test]
fn test_repeated_resolution_is_byte_identical() {
    let resolver = PlanResolver::new().with_probe(NoCheckpoints);
    let first = resolver.resolve(option_entries().into_iter().collect()).unwrap();
    for _ in 0..5 {
        let again = resolver.resolve(option_entries().into_iter().collect()).unwrap();
        assert_eq!(again.identity().as_str().as_bytes(), first.identity().as_str().as_bytes());
        assert_eq!(again, first);
    }
}
