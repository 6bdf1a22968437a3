//! Constrained many-to-many allocation solver.
//!
//! Constraints:
//! - sum(allocations) + fees + writeoffs = |transaction amount|
//! - allocation_i <= open_amount_i
//! - allocation_i >= 0
//!
//! Objective: maximize total allocation. Filling candidates in descending
//! confidence with `min(remaining, open_amount)` attains that maximum for
//! this objective, and is the designated solver when no LP backend is
//! present. Every solution is re-validated before persistence; a violated
//! constraint means the transaction stays unreconciled.

use std::collections::BTreeMap;

/// Conservation and cap tolerance, matching the invariant engine.
pub const TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct SolverCandidate {
    pub invoice_id: i64,
    pub open_amount: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AllocationSolution {
    /// invoice_id -> allocated amount.
    pub allocations: BTreeMap<i64, f64>,
    pub fees: f64,
    pub writeoffs: f64,
    pub unallocated: f64,
    pub solver_status: &'static str,
}

impl AllocationSolution {
    pub fn total_allocated(&self) -> f64 {
        self.allocations.values().sum()
    }

    /// A solution is complete when the full net amount found a home.
    pub fn is_complete(&self) -> bool {
        self.unallocated.abs() <= TOLERANCE
    }
}

/// Solve the allocation problem for one transaction.
pub fn solve(
    txn_amount: f64,
    candidates: &[SolverCandidate],
    fees: f64,
    writeoffs: f64,
) -> AllocationSolution {
    let txn_abs = txn_amount.abs();
    let net_amount = txn_abs - fees - writeoffs;

    if candidates.is_empty() {
        return AllocationSolution {
            allocations: BTreeMap::new(),
            fees,
            writeoffs,
            unallocated: net_amount.max(0.0),
            solver_status: "no_candidates",
        };
    }

    if net_amount <= 0.0 {
        return AllocationSolution {
            allocations: BTreeMap::new(),
            fees,
            writeoffs,
            unallocated: 0.0,
            solver_status: "fully_allocated_to_fees",
        };
    }

    // Descending confidence, invoice id as the deterministic tie-break.
    let mut ordered: Vec<&SolverCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.invoice_id.cmp(&b.invoice_id))
    });

    let mut allocations = BTreeMap::new();
    let mut remaining = net_amount;
    for cand in ordered {
        if remaining <= TOLERANCE {
            break;
        }
        let alloc = remaining.min(cand.open_amount);
        if alloc > TOLERANCE {
            allocations.insert(cand.invoice_id, alloc);
            remaining -= alloc;
        }
    }

    AllocationSolution {
        allocations,
        fees,
        writeoffs,
        unallocated: remaining,
        solver_status: "greedy",
    }
}

/// Post-solution validation. Never persist a solution that fails here.
pub fn validate(
    solution: &AllocationSolution,
    txn_amount: f64,
    open_amounts: &BTreeMap<i64, f64>,
) -> Result<(), String> {
    let total = solution.total_allocated() + solution.fees + solution.writeoffs;
    if (total - txn_amount.abs()).abs() > TOLERANCE {
        return Err(format!(
            "Conservation violated: allocated {total:.2} vs transaction {:.2}",
            txn_amount.abs()
        ));
    }
    for (invoice_id, alloc) in &solution.allocations {
        if *alloc < 0.0 {
            return Err(format!("Negative allocation {alloc:.2} for invoice {invoice_id}"));
        }
        let open = open_amounts.get(invoice_id).copied().unwrap_or(0.0);
        if *alloc > open + TOLERANCE {
            return Err(format!(
                "Allocation {alloc:.2} exceeds open amount {open:.2} for invoice {invoice_id}"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(invoice_id: i64, open_amount: f64, confidence: f64) -> SolverCandidate {
        SolverCandidate {
            invoice_id,
            open_amount,
            confidence,
        }
    }

    fn open_map(solution: &AllocationSolution, cands: &[SolverCandidate]) -> BTreeMap<i64, f64> {
        let _ = solution;
        cands.iter().map(|c| (c.invoice_id, c.open_amount)).collect()
    }

    #[test]
    fn test_bundled_payment_exact_split() {
        // One +6000 payment across three invoices of 1000/2000/3000.
        let cands = vec![
            cand(1, 1000.0, 0.9),
            cand(2, 2000.0, 0.8),
            cand(3, 3000.0, 0.7),
        ];
        let solution = solve(6000.0, &cands, 0.0, 0.0);
        assert!(solution.is_complete());
        assert_eq!(solution.allocations[&1], 1000.0);
        assert_eq!(solution.allocations[&2], 2000.0);
        assert_eq!(solution.allocations[&3], 3000.0);
        assert!(validate(&solution, 6000.0, &open_map(&solution, &cands)).is_ok());
    }

    #[test]
    fn test_partial_allocation_leaves_remainder() {
        let cands = vec![cand(1, 1000.0, 0.9)];
        let solution = solve(1500.0, &cands, 0.0, 0.0);
        assert!(!solution.is_complete());
        assert!((solution.unallocated - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_fees_reduce_net_amount() {
        let cands = vec![cand(1, 990.0, 0.9)];
        let solution = solve(1000.0, &cands, 10.0, 0.0);
        assert!(solution.is_complete());
        assert_eq!(solution.allocations[&1], 990.0);
        assert!(validate(&solution, 1000.0, &open_map(&solution, &cands)).is_ok());
    }

    #[test]
    fn test_fees_exceeding_amount() {
        let solution = solve(5.0, &[cand(1, 100.0, 0.9)], 10.0, 0.0);
        assert_eq!(solution.solver_status, "fully_allocated_to_fees");
        assert!(solution.allocations.is_empty());
    }

    #[test]
    fn test_confidence_orders_fill() {
        let cands = vec![cand(1, 500.0, 0.3), cand(2, 500.0, 0.9)];
        let solution = solve(500.0, &cands, 0.0, 0.0);
        assert_eq!(solution.allocations.len(), 1);
        assert!(solution.allocations.contains_key(&2));
    }

    #[test]
    fn test_validate_rejects_overmatch() {
        let mut allocations = BTreeMap::new();
        allocations.insert(1, 1200.0);
        let solution = AllocationSolution {
            allocations,
            fees: 0.0,
            writeoffs: 0.0,
            unallocated: 0.0,
            solver_status: "greedy",
        };
        let mut opens = BTreeMap::new();
        opens.insert(1, 1000.0);
        assert!(validate(&solution, 1200.0, &opens).is_err());
    }

    #[test]
    fn test_validate_rejects_conservation_gap() {
        let mut allocations = BTreeMap::new();
        allocations.insert(1, 800.0);
        let solution = AllocationSolution {
            allocations,
            fees: 0.0,
            writeoffs: 0.0,
            unallocated: 200.0,
            solver_status: "greedy",
        };
        let mut opens = BTreeMap::new();
        opens.insert(1, 1000.0);
        assert!(validate(&solution, 1000.0, &opens).is_err());
    }
}
