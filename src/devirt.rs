//! Top-level devirtualizer: scans for virtualized entries, reconstructs VM
//! instances and drives the recursive control-flow exploration that lifts
//! each routine into IR.
//!
//! Lifting simulates the VM's fetch-decode-execute loop statically: every
//! handler is matched once against the instruction set and cached, its IR is
//! emitted into the current block, and its bridge advances the context to the
//! next handler. Branches, block splits and VMEXITs fork or terminate blocks
//! as described by the matched descriptor's flags.

use std::sync::{Arc, Mutex};

use iced_x86::{Instruction, Mnemonic, OpKind};

use crate::analysis::matcher::StackSlot;
use crate::disasm;
use crate::image::MappedImage;
use crate::ir::tracer::{self, SymExpr, Tracer};
use crate::ir::{Operand, Reg, Routine};
use crate::vm::bridge::VmBridge;
use crate::vm::handler::VmHandler;
use crate::vm::instance::VmInstance;
use crate::vm::isa::VmOpcodeFlags;
use crate::vm::{Direction, VmContext};

/// Arbitrary constants standing in for the return slot and stub the
/// obfuscator spills before entering the VM.
const RETADDR_PLACEHOLDER: u64 = 0xDEAD_C0DE_DEAD_C0DE;
const STUB_PLACEHOLDER: u64 = 0xBABE_BABE_BABE_BABE;

/// One routine to be lifted: the encrypted VIP seed and the VMENTRY it is
/// handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiftingJob {
    pub entry_stub: u64,
    pub vmentry_rva: u64,
}

/// A scan hit: the code RVA whose `jmp` leads into the VM, plus the job.
#[derive(Debug, Clone, Copy)]
pub struct ScanResult {
    pub rva: u64,
    pub job: LiftingJob,
}

/// Result of analyzing a suspected VMENTRY stub.
#[derive(Debug, Clone)]
pub struct EntryStubAnalysis {
    /// An instruction the obfuscator could not virtualize, executed natively
    /// right before re-entering the VM. Present only in the 3-instruction
    /// stub variant.
    pub pre_stub: Option<Instruction>,
    pub job: LiftingJob,
}

/// The root object: owns the mapped image and the VM-instance registry.
pub struct Devirtualizer {
    image: MappedImage,
    preferred_base: u64,
    instances: Mutex<Vec<Arc<VmInstance>>>,
}

impl Devirtualizer {
    /// Construct from the raw bytes of a PE file.
    pub fn new(raw: &[u8]) -> pelite::Result<Self> {
        Ok(Self::from_image(MappedImage::map(raw)?))
    }

    /// Construct from an already-mapped image.
    pub fn from_image(image: MappedImage) -> Self {
        let preferred_base = image.preferred_base();
        Self {
            image,
            preferred_base,
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn image(&self) -> &MappedImage {
        &self.image
    }

    fn lookup_instance(&self, rva: u64) -> Option<Arc<VmInstance>> {
        self.instances.lock().unwrap().iter().find(|i| i.rva == rva).cloned()
    }

    fn intern_instance(&self, instance: VmInstance) -> Arc<VmInstance> {
        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.iter().find(|i| i.rva == instance.rva) {
            return existing.clone();
        }
        let instance = Arc::new(instance);
        instances.push(instance.clone());
        instance
    }

    /// Look up or reconstruct the VM instance at `rva` and build the initial
    /// context for `stub`.
    fn prepare(&self, rva: u64, stub: u64) -> Option<(Arc<VmInstance>, VmContext<'_>)> {
        let instance = match self.lookup_instance(rva) {
            Some(instance) => instance,
            None => {
                let stream = disasm::disassemble(&self.image, rva);
                let instance = VmInstance::from_stream(&stream)?;
                self.intern_instance(instance)
            }
        };

        // The image is mapped at RVA zero, so the load delta is simply the
        // negated preferred base.
        let ctx = self.image_context(&instance, stub);
        Some((instance, ctx))
    }

    fn image_context<'i>(&'i self, instance: &VmInstance, stub: u64) -> VmContext<'i> {
        instance.initialize_context(&self.image, stub, -(self.preferred_base as i64))
    }

    /// Lift one scanned routine into a fresh IR routine.
    pub fn lift(&self, job: &LiftingJob) -> Option<Routine> {
        log::debug!(
            "lifting job: vmentry 0x{:x}, stub 0x{:x}",
            job.vmentry_rva,
            job.entry_stub
        );

        let (instance, mut ctx) = self.prepare(job.vmentry_rva, job.entry_stub)?;
        let entry_vip = ctx.vip.wrapping_add(self.preferred_base);
        let mut routine = Routine::new(entry_vip);
        self.enter_vm(&mut routine, entry_vip, &instance, &mut ctx).then_some(routine)
    }

    /// Continue lifting into another VMENTRY, forking off `prev_block`.
    fn lift_internal(&self, routine: &mut Routine, rva: u64, stub: u64, prev_block: u64) -> bool {
        let Some((instance, mut ctx)) = self.prepare(rva, stub)
        else {
            return false;
        };

        let block_vip = ctx.vip.wrapping_add(self.preferred_base);
        if !routine.block(prev_block).is_some_and(|b| b.is_complete()) {
            routine.block_mut(prev_block).jmp(Operand::imm64(block_vip));
        }
        let Some(next) = routine.fork(prev_block, block_vip)
        else {
            return false;
        };

        self.enter_vm(routine, next, &instance, &mut ctx)
    }

    /// Materialize the VM entry frame into `block_vip` and lift from the
    /// entry bridge onwards.
    fn enter_vm(
        &self,
        routine: &mut Routine,
        block_vip: u64,
        instance: &Arc<VmInstance>,
        ctx: &mut VmContext,
    ) -> bool {
        let block = routine.block_mut(block_vip);

        block
            .push(Operand::imm64(RETADDR_PLACEHOLDER))
            .push(Operand::imm64(STUB_PLACEHOLDER));
        for slot in &instance.entry_frame {
            match slot {
                StackSlot::Flags => block.push(Reg::Flags),
                StackSlot::Register(reg) => block.push(Reg::Phys(*reg)),
            };
        }

        // The obfuscator's own fixup push is replaced with the live image
        // base so downstream tracing can recognize and erase it.
        let base = block.tmp(64);
        block.mov(base, Reg::ImageBase).push(base);

        let first_handler = instance.bridge.advance(ctx);
        self.lift_block(routine, instance, block_vip, ctx, first_handler, Vec::new())
    }

    /// Lift a single basic block, recursing into branch targets and
    /// continuation entries.
    fn lift_block(
        &self,
        routine: &mut Routine,
        instance: &Arc<VmInstance>,
        block_vip: u64,
        ctx: &mut VmContext,
        first_handler_rva: u64,
        mut explored: Vec<u64>,
    ) -> bool {
        log::debug!(
            "lifting block: vip 0x{:x}, first handler 0x{:x}",
            block_vip,
            first_handler_rva
        );
        explored.push(block_vip);

        let mut handler_rva = first_handler_rva;
        loop {
            let handler = match instance.find_handler(handler_rva) {
                Some(handler) => {
                    // Cached handlers skip matching, so state mutations must
                    // be replayed by hand.
                    if handler.descriptor.flags.contains(VmOpcodeFlags::UPDATES_STATE)
                        && let Some(updated) = handler.info.updated_state
                    {
                        ctx.state = updated;
                    }
                    handler
                }
                None => {
                    let stream = disasm::disassemble(&self.image, handler_rva);
                    let Some(handler) = VmHandler::from_stream(&mut ctx.state, &stream)
                    else {
                        log::error!("no handler template matched at rva 0x{handler_rva:x}");
                        return false;
                    };
                    instance.add_handler(handler)
                }
            };

            let previous_key = ctx.rolling_key;
            let decoded = handler.decode(ctx);
            log::trace!(
                "0x{:016x} | 0x{:016x} | 0x{:016x} | {}",
                ctx.vip,
                handler_rva,
                previous_key,
                decoded
            );

            (handler.descriptor.emit)(routine.block_mut(block_vip), &decoded);

            let flags = handler.descriptor.flags;

            if flags.contains(VmOpcodeFlags::VMEXIT) {
                self.handle_vmexit(routine, block_vip);
                return true;
            }

            if flags.contains(VmOpcodeFlags::BRANCH) {
                let Some(bridge) = handler.bridge.as_ref()
                else {
                    return false;
                };
                self.handle_branch(routine, instance, block_vip, ctx, bridge, &explored);
                return true;
            }

            if flags.contains(VmOpcodeFlags::CREATES_BASIC_BLOCK) {
                let mut new_block_ea = ctx.vip.wrapping_add(self.preferred_base);
                // Upward streams get a -1 bias so they never collide with a
                // downward stream at the same address.
                if ctx.state.direction == Direction::Up {
                    new_block_ea -= 1;
                }

                routine.block_mut(block_vip).jmp(Operand::imm64(new_block_ea));
                if let Some(next) = routine.fork(block_vip, new_block_ea) {
                    let Some(bridge) = handler.bridge.as_ref()
                    else {
                        return false;
                    };
                    let first = bridge.advance(ctx);
                    return self.lift_block(routine, instance, next, ctx, first, explored);
                }
                return true;
            }

            let Some(bridge) = handler.bridge.as_ref()
            else {
                return false;
            };
            handler_rva = bridge.advance(ctx);
        }
    }

    /// Resolve where a VMEXIT goes: a continuation entry (unsupported
    /// instruction), a virtualized call, or a plain exit.
    fn handle_vmexit(&self, routine: &mut Routine, block_vip: u64) {
        let block = routine.block_mut(block_vip);
        let t0 = block.tmp(64);
        block.pop(t0);

        let mut tracer = Tracer::new();
        let dest = remove_imgbase(tracer.rtrace(routine, block_vip, t0));
        log::debug!("vmexit destination: {dest:x?}");

        if let Some(ea) = dest.as_constant()
            && ea != 0
        {
            let rva = ea.wrapping_sub(self.preferred_base);
            if let Some(analysis) = self.analyze_entry_stub(rva) {
                // The exit only exists because of an instruction the
                // obfuscator could not virtualize; emit it verbatim and
                // continue into the next entry.
                if let Some(pre_stub) = &analysis.pre_stub {
                    let (reads, writes) = disasm::regs_accessed(pre_stub);
                    let bytes = self
                        .image
                        .read(pre_stub.ip(), pre_stub.len())
                        .map(|b| b[..pre_stub.len()].to_vec())
                        .unwrap_or_default();

                    let block = routine.block_mut(block_vip);
                    for reg in reads {
                        block.vpinr(reg);
                    }
                    for byte in bytes {
                        block.vemit(byte);
                    }
                    for reg in writes {
                        block.vpinw(reg);
                    }
                }

                self.lift_internal(routine, analysis.job.vmentry_rva, analysis.job.entry_stub, block_vip);
                return;
            }
        }

        // A VXCALL leaves the continuation stub as the next 64-bit value on
        // the stack.
        let block = routine.block_mut(block_vip);
        let t1 = block.tmp(64);
        block.pop(t1);

        tracer.flush();
        let retaddr = remove_imgbase(tracer.rtrace(routine, block_vip, t1));
        log::debug!("vmexit potential retaddr: {retaddr:x?}");

        if let Some(ea) = retaddr.as_constant() {
            let rva = ea.wrapping_sub(self.preferred_base);
            if let Some(analysis) = self.analyze_entry_stub(rva) {
                routine.block_mut(block_vip).vxcall(t0);
                self.lift_internal(routine, analysis.job.vmentry_rva, analysis.job.entry_stub, block_vip);
                return;
            }
        }

        routine.block_mut(block_vip).vexit(t0);
    }

    /// Fork and lift every constant destination of a synthesized branch.
    fn handle_branch(
        &self,
        routine: &mut Routine,
        instance: &Arc<VmInstance>,
        block_vip: u64,
        ctx: &VmContext,
        bridge: &VmBridge,
        explored: &[u64],
    ) {
        let mut tracer = Tracer::new();
        let destinations = tracer::analyze_branch(routine, &mut tracer, block_vip);
        log::debug!("branch destinations: {destinations:x?}");

        for dest in destinations {
            let Some(branch_ea) = dest.as_constant()
            else {
                continue;
            };

            let Some(next) = routine.fork(block_vip, branch_ea)
            else {
                continue;
            };
            if explored.contains(&branch_ea) {
                log::debug!("skipping already explored block 0x{branch_ea:x}");
                continue;
            }

            // Undo the -1 bias upward streams carry in their block identity.
            let mut branch_rva = branch_ea.wrapping_sub(self.preferred_base);
            if ctx.state.direction == Direction::Up {
                branch_rva = branch_rva.wrapping_add(1);
            }

            // Each destination walks with its own context; the rolling key
            // reseeds from the branch's logical VIP.
            let mut branch_ctx = VmContext::new(
                &self.image,
                ctx.state,
                branch_rva.wrapping_add(self.preferred_base),
                branch_rva,
            );
            let first = bridge.advance(&mut branch_ctx);
            self.lift_block(routine, instance, next, &mut branch_ctx, first, explored.to_vec());
        }
    }

    /// Analyze a suspected VMENTRY stub.
    ///
    /// The stub is at most three instructions up to its first branch and must
    /// end in `push imm; call imm`; a third leading instruction is the
    /// unsupported-instruction passthrough.
    pub fn analyze_entry_stub(&self, rva: u64) -> Option<EntryStubAnalysis> {
        let stream = disasm::disassemble_stub(&self.image, rva);
        let instructions = stream.instructions();
        if !(2..=3).contains(&instructions.len()) {
            return None;
        }

        let call = &instructions[instructions.len() - 1];
        let push = &instructions[instructions.len() - 2];

        if call.mnemonic() != Mnemonic::Call
            || !matches!(call.op0_kind(), OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64)
        {
            return None;
        }
        if push.mnemonic() != Mnemonic::Push || push.try_immediate(0).is_err() {
            return None;
        }

        Some(EntryStubAnalysis {
            pre_stub: (instructions.len() == 3).then(|| instructions[0]),
            job: LiftingJob {
                entry_stub: push.try_immediate(0).ok()?,
                vmentry_rva: call.near_branch_target(),
            },
        })
    }

    /// Scan `section_name` for `jmp imm` trampolines into the obfuscator's VM
    /// sections and verify each target is a clean two-instruction entry stub.
    pub fn scan_for_vmentry(&self, section_name: &str) -> Vec<ScanResult> {
        let mut results = Vec::new();

        let Some(target) = self.image.sections().iter().find(|s| s.name == section_name)
        else {
            log::warn!("section {section_name} not found in image");
            return results;
        };

        let is_vm_section =
            |name: &str| name.ends_with('0') || name.ends_with('1');

        let instructions = disasm::disassemble_simple(
            &self.image,
            target.rva,
            target.rva + target.virtual_size,
        );

        for instruction in instructions {
            if !disasm::is_jmp_imm(&instruction) {
                continue;
            }
            let stub_rva = instruction.near_branch_target();
            let in_vm_section = self
                .image
                .section_of(stub_rva)
                .is_some_and(|s| is_vm_section(&s.name));
            if !in_vm_section {
                continue;
            }

            if let Some(analysis) = self.analyze_entry_stub(stub_rva)
                && analysis.pre_stub.is_none()
            {
                results.push(ScanResult {
                    rva: instruction.ip(),
                    job: analysis.job,
                });
            }
        }

        results
    }
}

/// Erase the symbolic image base from a traced expression, leaving the
/// preferred-base constant part.
fn remove_imgbase(expr: SymExpr) -> SymExpr {
    expr.transform(&mut |e| {
        if let SymExpr::Linear { terms, .. } = e {
            terms.retain(|(reg, _)| *reg != Reg::ImageBase);
        }
    })
    .simplify()
}
