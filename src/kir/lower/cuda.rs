//! CUDA C++ backend.
//!
//! Registers become locals declared up front, blocks become labels and
//! branches become `goto`. Phis are resolved by copies on each incoming
//! edge, staged through temporaries so they behave as parallel copies.

use std::fmt::Write;

use super::KernelLowering;
use crate::kir::{
    BinOp, BlockId, CastOp, CmpPred, FloatOp, IntType, KIROp, Kernel, ParamAccess, RegType,
    SpecialReg, Terminator, Value,
};

pub struct CudaLowering;

fn c_type(ty: RegType) -> &'static str {
    match ty {
        RegType::Int(IntType::I1) => "bool",
        RegType::Int(IntType::I32) => "unsigned int",
        RegType::Int(IntType::I64) => "unsigned long long",
        RegType::F32 => "float",
    }
}

fn imm(v: Value, ty: IntType) -> String {
    match (v, ty) {
        (Value::Reg(r), _) => r.to_string(),
        (Value::Imm(x), IntType::I1) => (x != 0).to_string(),
        (Value::Imm(x), IntType::I32) => format!("{}u", x),
        (Value::Imm(x), IntType::I64) => format!("{}ull", x),
    }
}

fn special(sreg: SpecialReg) -> String {
    match sreg {
        SpecialReg::BlockId(axis) => format!("blockIdx.{}", axis),
        SpecialReg::ThreadId(axis) => format!("threadIdx.{}", axis),
    }
}

/// Copies feeding the phis of `to` when control arrives from `from`.
fn edge_copies(kernel: &Kernel, from: BlockId, to: BlockId, indent: &str) -> String {
    let phis: Vec<_> = kernel
        .block(to)
        .ops
        .iter()
        .filter_map(|op| match op {
            KIROp::Phi { dst, ty, incoming } => incoming
                .iter()
                .find(|(_, b)| *b == from)
                .map(|(v, _)| (*dst, *ty, *v)),
            _ => None,
        })
        .collect();
    let mut out = String::new();
    for (i, (_, ty, v)) in phis.iter().enumerate() {
        let _ = writeln!(out, "{}{} phi_tmp{} = {};", indent, c_type(RegType::Int(*ty)), i, imm(*v, *ty));
    }
    for (i, (dst, _, _)) in phis.iter().enumerate() {
        let _ = writeln!(out, "{}{} = phi_tmp{};", indent, dst, i);
    }
    out
}

impl KernelLowering for CudaLowering {
    fn target_name(&self) -> &str {
        "cuda"
    }

    fn lower(&self, kernel: &Kernel) -> String {
        let mut out = String::new();
        let params: Vec<String> = kernel
            .params
            .iter()
            .map(|p| match p.access {
                ParamAccess::Read => format!("const float* __restrict__ {}", p.name),
                ParamAccess::Write => format!("float* __restrict__ {}", p.name),
            })
            .collect();
        let _ = writeln!(
            out,
            "extern \"C\" __global__ void {}({}) {{",
            kernel.name.replace(['.', '-'], "_"),
            params.join(", ")
        );

        for (i, ty) in kernel.reg_types.iter().enumerate() {
            let reg = crate::kir::Reg(i as u32);
            match kernel.reg_name(reg) {
                Some(name) => {
                    let _ = writeln!(out, "  {} {}; // {}", c_type(*ty), reg, name);
                }
                None => {
                    let _ = writeln!(out, "  {} {};", c_type(*ty), reg);
                }
            }
        }

        for block in &kernel.blocks {
            let _ = writeln!(out, "{}: // {}", block.id, block.name);
            for op in &block.ops {
                let line = match op {
                    KIROp::Phi { .. } => continue,
                    KIROp::ReadSpecial { dst, sreg, range } => match range {
                        Some((lo, hi)) => format!("{} = {}; // range [{}, {})", dst, special(*sreg), lo, hi),
                        None => format!("{} = {};", dst, special(*sreg)),
                    },
                    KIROp::Cast { dst, op, src, from, to } => match op {
                        CastOp::ZExt | CastOp::Trunc => {
                            format!("{} = ({}){};", dst, c_type(RegType::Int(*to)), imm(*src, *from))
                        }
                    },
                    KIROp::Binary { dst, op, ty, lhs, rhs, .. } => {
                        let sym = match op {
                            BinOp::Add => "+",
                            BinOp::Sub => "-",
                            BinOp::Mul => "*",
                            BinOp::UDiv => "/",
                            BinOp::URem => "%",
                        };
                        format!("{} = {} {} {};", dst, imm(*lhs, *ty), sym, imm(*rhs, *ty))
                    }
                    KIROp::ICmp { dst, pred, ty, lhs, rhs } => {
                        let sym = match pred {
                            CmpPred::Ult => "<",
                            CmpPred::Eq => "==",
                        };
                        format!("{} = {} {} {};", dst, imm(*lhs, *ty), sym, imm(*rhs, *ty))
                    }
                    KIROp::Assume(cond) => format!("__builtin_assume({});", imm(*cond, IntType::I1)),
                    KIROp::Load { dst, array, addr } => {
                        format!("{} = {}[{}];", dst, array, imm(*addr, IntType::I64))
                    }
                    KIROp::Store { array, addr, value } => {
                        format!("{}[{}] = {};", array, imm(*addr, IntType::I64), value)
                    }
                    KIROp::Float { dst, op, args } => match op {
                        FloatOp::Neg => format!("{} = -{};", dst, args[0]),
                        FloatOp::Add => format!("{} = {} + {};", dst, args[0], args[1]),
                        FloatOp::Mul => format!("{} = {} * {};", dst, args[0], args[1]),
                    },
                    KIROp::Comment(text) => format!("// {}", text),
                };
                let _ = writeln!(out, "  {}", line);
            }
            match &block.terminator {
                Some(Terminator::Ret) | None => {
                    let _ = writeln!(out, "  return;");
                }
                Some(Terminator::Br(target)) => {
                    let copies = edge_copies(kernel, block.id, *target, "    ");
                    if copies.is_empty() {
                        let _ = writeln!(out, "  goto {};", target);
                    } else {
                        // Scoped so the temporaries are not jumped over.
                        let _ = writeln!(out, "  {{");
                        out.push_str(&copies);
                        let _ = writeln!(out, "    goto {};", target);
                        let _ = writeln!(out, "  }}");
                    }
                }
                Some(Terminator::CondBr {
                    cond,
                    if_true,
                    if_false,
                }) => {
                    let _ = writeln!(out, "  if ({}) {{", imm(*cond, IntType::I1));
                    out.push_str(&edge_copies(kernel, block.id, *if_true, "    "));
                    let _ = writeln!(out, "    goto {};", if_true);
                    let _ = writeln!(out, "  }} else {{");
                    out.push_str(&edge_copies(kernel, block.id, *if_false, "    "));
                    let _ = writeln!(out, "    goto {};", if_false);
                    let _ = writeln!(out, "  }}");
                }
            }
        }
        out.push_str("}\n");
        out
    }
}
