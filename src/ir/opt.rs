//! Conservative cleanup passes for lifted routines.
//!
//! The lifter emits handler bodies verbatim, which leaves plenty of dead
//! temporaries behind (flag scaffolding for values nothing reads, scratch
//! copies around multiplies). These passes only remove what is provably
//! unobservable inside a single block; real optimization is a downstream
//! concern.

use super::{Op, Operand, Reg, Routine};

/// Run every pass to a fixed point. Returns the total number of removed ops.
pub fn apply_all(routine: &mut Routine) -> usize {
    let mut total = 0;
    loop {
        let removed = prune_nops(routine) + prune_dead_tmps(routine);
        if removed == 0 {
            return total;
        }
        total += removed;
    }
}

/// Remove `nop` padding emitted for flow-reestablishing handlers.
pub fn prune_nops(routine: &mut Routine) -> usize {
    let mut removed = 0;
    for block in routine.blocks.values_mut() {
        let before = block.ops.len();
        block.ops.retain(|op| !matches!(op, Op::Nop));
        removed += before - block.ops.len();
    }
    removed
}

/// Remove side-effect-free ops whose destination temporary is dead: never
/// read again within its block. A single backward liveness scan per block
/// collapses whole dead chains at once.
pub fn prune_dead_tmps(routine: &mut Routine) -> usize {
    let mut removed = 0;
    for block in routine.blocks.values_mut() {
        let mut live: Vec<Reg> = Vec::new();
        let mut keep = vec![true; block.ops.len()];

        for (i, op) in block.ops.iter().enumerate().rev() {
            if let Some(def @ Reg::Tmp { .. }) = pure_def(op)
                && !live.contains(&def)
            {
                keep[i] = false;
                continue;
            }

            // Kill before gen, so read-modify-write ops keep their own
            // source live.
            if let Some(def) = def_of(op) {
                live.retain(|r| *r != def);
            }
            for_each_source(op, &mut |reg| {
                if matches!(reg, Reg::Tmp { .. }) && !live.contains(&reg) {
                    live.push(reg);
                }
            });
        }

        let mut index = 0;
        block.ops.retain(|_| {
            let kept = keep[index];
            index += 1;
            kept
        });
        removed += keep.iter().filter(|k| !**k).count();
    }
    removed
}

fn source_reg(operand: &Operand, f: &mut impl FnMut(Reg)) {
    if let Operand::Reg(reg) = operand {
        f(*reg);
    }
}

/// Visit every register an op reads.
fn for_each_source(op: &Op, f: &mut impl FnMut(Reg)) {
    match op {
        Op::Push(a) | Op::Jmp(a) | Op::Vxcall(a) | Op::Vexit(a) => source_reg(a, f),
        Op::Mov(_, a) => source_reg(a, f),
        Op::Ifs(_, cond, value) => {
            source_reg(cond, f);
            source_reg(value, f);
        }
        // Read-modify-write ops read their destination too.
        Op::Add(d, a)
        | Op::Sub(d, a)
        | Op::Mul(d, a)
        | Op::Mulhi(d, a)
        | Op::Imul(d, a)
        | Op::Imulhi(d, a)
        | Op::Bshl(d, a)
        | Op::Bshr(d, a)
        | Op::Bor(d, a)
        | Op::Band(d, a)
        | Op::Bxor(d, a) => {
            f(*d);
            source_reg(a, f);
        }
        Op::Bnot(d) => f(*d),
        Op::Div(d, a, b) | Op::Rem(d, a, b) | Op::Idiv(d, a, b) | Op::Irem(d, a, b) => {
            f(*d);
            source_reg(a, f);
            source_reg(b, f);
        }
        Op::Tl(_, a, b) | Op::Te(_, a, b) | Op::Tne(_, a, b) | Op::Tul(_, a, b) => {
            source_reg(a, f);
            source_reg(b, f);
        }
        Op::Str { base, offset, value } => {
            f(*base);
            source_reg(offset, f);
            source_reg(value, f);
        }
        Op::Ldd { base, offset, .. } => {
            f(*base);
            source_reg(offset, f);
        }
        _ => {}
    }
}

/// Every register an op defines, including ones with side effects.
fn def_of(op: &Op) -> Option<Reg> {
    match op {
        Op::Pop(d) => Some(*d),
        other => pure_def(other),
    }
}

/// The destination of an op that has no effect beyond that destination.
fn pure_def(op: &Op) -> Option<Reg> {
    match op {
        Op::Mov(d, _)
        | Op::Add(d, _)
        | Op::Sub(d, _)
        | Op::Mul(d, _)
        | Op::Mulhi(d, _)
        | Op::Imul(d, _)
        | Op::Imulhi(d, _)
        | Op::Bshl(d, _)
        | Op::Bshr(d, _)
        | Op::Bor(d, _)
        | Op::Band(d, _)
        | Op::Bxor(d, _)
        | Op::Bnot(d)
        | Op::Tl(d, _, _)
        | Op::Te(d, _, _)
        | Op::Tne(d, _, _)
        | Op::Tul(d, _, _)
        | Op::Ifs(d, _, _) => Some(*d),
        Op::Ldd { dst, .. } => Some(*dst),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;

    #[test]
    fn dead_chains_collapse_transitively() {
        let mut routine = Routine::new(0);
        let block = routine.block_mut(0);
        let [t0, t1] = block.tmps([64, 64]);
        block
            .mov(t0, Operand::imm64(1))
            .add(t0, Operand::imm64(2)) // dead with t0
            .mov(t1, Operand::imm64(3))
            .push(t1)
            .nop();

        let removed = apply_all(&mut routine);
        assert_eq!(removed, 3);
        assert_eq!(routine.block(0).unwrap().ops.len(), 2);
    }

    #[test]
    fn observable_destinations_are_kept() {
        let mut routine = Routine::new(0);
        let block = routine.block_mut(0);
        let t0 = block.tmp(64);
        block
            .mov(crate::ir::Reg::Flags, Operand::imm64(0)) // not a tmp
            .pop(t0) // stack effect
            .str_(t0, Operand::imm64(0), Operand::imm64(1)); // memory write

        assert_eq!(apply_all(&mut routine), 0);
        assert_eq!(routine.block(0).unwrap().ops.len(), 3);
    }
}
