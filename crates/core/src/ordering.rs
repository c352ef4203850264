use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::ChainOrderingError;
use crate::models::{CortexIntent, IntentChain};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedChain {
    pub chain: IntentChain,
    pub repaired: bool,
}

impl IntentChain {
    pub fn new(steps: Vec<CortexIntent>) -> Result<Self, ChainOrderingError> {
        if steps.is_empty() {
            return Err(ChainOrderingError::Empty);
        }
        if let Some(err) = first_violation(&steps) {
            return Err(err);
        }
        Ok(Self::from_ordered(steps))
    }
}

pub fn is_dependency_ordered(steps: &[CortexIntent]) -> bool {
    first_violation(steps).is_none()
}

fn first_violation(steps: &[CortexIntent]) -> Option<ChainOrderingError> {
    for (idx, step) in steps.iter().enumerate() {
        for slot in &step.requires {
            let satisfied = steps[..idx]
                .iter()
                .any(|earlier| earlier.produces.contains(slot));
            if !satisfied {
                return Some(ChainOrderingError::UnresolvedDependency {
                    step: idx,
                    intent: step.intent.to_string(),
                    slot: slot.clone(),
                });
            }
        }
    }
    None
}

// A required slot binds to the closest earlier producer, else the first later one.
pub fn order_steps(steps: Vec<CortexIntent>) -> Result<OrderedChain, ChainOrderingError> {
    if steps.is_empty() {
        return Err(ChainOrderingError::Empty);
    }

    let count = steps.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut pending = vec![0usize; count];

    for (idx, step) in steps.iter().enumerate() {
        let mut producers = Vec::new();
        for slot in &step.requires {
            let before = (0..idx).rev().find(|&j| steps[j].produces.contains(slot));
            let after = (idx + 1..count).find(|&j| steps[j].produces.contains(slot));
            let producer = before.or(after).ok_or_else(|| {
                ChainOrderingError::UnresolvedDependency {
                    step: idx,
                    intent: step.intent.to_string(),
                    slot: slot.clone(),
                }
            })?;
            if !producers.contains(&producer) {
                producers.push(producer);
            }
        }
        for producer in producers {
            dependents[producer].push(idx);
            pending[idx] += 1;
        }
    }

    let mut ready = (0..count)
        .filter(|&idx| pending[idx] == 0)
        .map(Reverse)
        .collect::<BinaryHeap<_>>();
    let mut order = Vec::with_capacity(count);

    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &next in &dependents[idx] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < count {
        let steps = (0..count).filter(|idx| pending[*idx] > 0).collect();
        return Err(ChainOrderingError::Cycle { steps });
    }

    let repaired = order.iter().enumerate().any(|(pos, &idx)| pos != idx);
    let mut remaining = steps.into_iter().map(Some).collect::<Vec<_>>();
    let ordered = order
        .into_iter()
        .filter_map(|idx| remaining[idx].take())
        .collect();

    Ok(OrderedChain {
        chain: IntentChain::from_ordered(ordered),
        repaired,
    })
}
