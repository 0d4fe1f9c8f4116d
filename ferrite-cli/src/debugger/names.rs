//! GPR and CSR name tables shared by the expression evaluator, the
//! disassembler, and the `info` command.

use ferrite_core::core::csr;
use ferrite_core::instruction::CsrSpecifier;

/// ABI names of the `x` registers, indexed by register number.
pub const GPR_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", //
    "fp", "s1", "a0", "a1", "a2", "a3", "a4", "a5", //
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", //
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

/// The CSRs printed by `info csr`, in display order.
pub const INFO_CSRS: [&str; 17] = [
    "sstatus", "sscratch", "sepc", "satp", //
    "mstatus", "misa", "mie", "mtvec", "mscratch", //
    "mepc", "mcause", "mtval", "mip", //
    "mcycle", "minstret", "mcycleh", "minstreth",
];

/// A register reference in a debugger expression or listing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRef {
    Gpr(u8),
    Pc,
    Csr(CsrSpecifier),
}

/// Resolve a register name (ABI or numeric GPR name, `pc`, or a CSR name)
/// to its reference.
pub fn lookup(name: &str) -> Option<RegRef> {
    if let Some(index) = GPR_NAMES.iter().position(|&n| n == name) {
        return Some(RegRef::Gpr(index as u8));
    }
    if name == "s0" {
        return Some(RegRef::Gpr(8));
    }
    if let Some(digits) = name.strip_prefix('x') {
        if let Ok(index) = digits.parse::<u8>() {
            if index < 32 {
                return Some(RegRef::Gpr(index));
            }
        }
    }
    if name == "pc" {
        return Some(RegRef::Pc);
    }
    csr_address(name).map(RegRef::Csr)
}

/// Resolve a CSR name to its 12-bit address.
pub fn csr_address(name: &str) -> Option<CsrSpecifier> {
    let address = match name {
        "cycle" => csr::CYCLE,
        "time" => csr::TIME,
        "instret" => csr::INSTRET,
        "cycleh" => csr::CYCLEH,
        "timeh" => csr::TIMEH,
        "instreth" => csr::INSTRETH,
        "sstatus" => csr::SSTATUS,
        "sie" => csr::SIE,
        "stvec" => csr::STVEC,
        "scounteren" => csr::SCOUNTEREN,
        "sscratch" => csr::SSCRATCH,
        "sepc" => csr::SEPC,
        "scause" => csr::SCAUSE,
        "stval" => csr::STVAL,
        "sip" => csr::SIP,
        "satp" => csr::SATP,
        "mvendorid" => csr::MVENDORID,
        "marchid" => csr::MARCHID,
        "mimpid" => csr::MIMPID,
        "mhartid" => csr::MHARTID,
        "mstatus" => csr::MSTATUS,
        "misa" => csr::MISA,
        "medeleg" => csr::MEDELEG,
        "mideleg" => csr::MIDELEG,
        "mie" => csr::MIE,
        "mtvec" => csr::MTVEC,
        "mcounteren" => csr::MCOUNTEREN,
        "mscratch" => csr::MSCRATCH,
        "mepc" => csr::MEPC,
        "mcause" => csr::MCAUSE,
        "mtval" => csr::MTVAL,
        "mip" => csr::MIP,
        "mcycle" => csr::MCYCLE,
        "minstret" => csr::MINSTRET,
        "mcycleh" => csr::MCYCLEH,
        "minstreth" => csr::MINSTRETH,
        "mcountinhibit" => csr::MCOUNTINHIBIT,
        _ => {
            if let Some(digits) = name.strip_prefix("pmpcfg") {
                let n: u16 = digits.parse().ok()?;
                return (n < 4).then_some(csr::PMPCFG0 + n);
            }
            if let Some(digits) = name.strip_prefix("pmpaddr") {
                let n: u16 = digits.parse().ok()?;
                return (n < 16).then_some(csr::PMPADDR0 + n);
            }
            return None;
        }
    };
    Some(address)
}

/// Name of a CSR address, for the disassembler. Unknown addresses render as
/// bare hex.
pub fn csr_name(address: CsrSpecifier) -> String {
    let known = [
        (csr::CYCLE, "cycle"),
        (csr::TIME, "time"),
        (csr::INSTRET, "instret"),
        (csr::CYCLEH, "cycleh"),
        (csr::TIMEH, "timeh"),
        (csr::INSTRETH, "instreth"),
        (csr::SSTATUS, "sstatus"),
        (csr::SIE, "sie"),
        (csr::STVEC, "stvec"),
        (csr::SCOUNTEREN, "scounteren"),
        (csr::SSCRATCH, "sscratch"),
        (csr::SEPC, "sepc"),
        (csr::SCAUSE, "scause"),
        (csr::STVAL, "stval"),
        (csr::SIP, "sip"),
        (csr::SATP, "satp"),
        (csr::MVENDORID, "mvendorid"),
        (csr::MARCHID, "marchid"),
        (csr::MIMPID, "mimpid"),
        (csr::MHARTID, "mhartid"),
        (csr::MSTATUS, "mstatus"),
        (csr::MISA, "misa"),
        (csr::MEDELEG, "medeleg"),
        (csr::MIDELEG, "mideleg"),
        (csr::MIE, "mie"),
        (csr::MTVEC, "mtvec"),
        (csr::MCOUNTEREN, "mcounteren"),
        (csr::MSCRATCH, "mscratch"),
        (csr::MEPC, "mepc"),
        (csr::MCAUSE, "mcause"),
        (csr::MTVAL, "mtval"),
        (csr::MIP, "mip"),
        (csr::MCYCLE, "mcycle"),
        (csr::MINSTRET, "minstret"),
        (csr::MCYCLEH, "mcycleh"),
        (csr::MINSTRETH, "minstreth"),
        (csr::MCOUNTINHIBIT, "mcountinhibit"),
    ];
    match known.iter().find(|(addr, _)| *addr == address) {
        Some((_, name)) => (*name).to_owned(),
        None => format!("{address:#05x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(Some(RegRef::Gpr(0)), lookup("zero"));
        assert_eq!(Some(RegRef::Gpr(0)), lookup("x0"));
        assert_eq!(Some(RegRef::Gpr(8)), lookup("s0"));
        assert_eq!(Some(RegRef::Gpr(8)), lookup("fp"));
        assert_eq!(Some(RegRef::Gpr(10)), lookup("a0"));
        assert_eq!(Some(RegRef::Pc), lookup("pc"));
        assert_eq!(Some(RegRef::Csr(csr::MSTATUS)), lookup("mstatus"));
        assert_eq!(Some(RegRef::Csr(csr::PMPADDR0 + 3)), lookup("pmpaddr3"));
        assert_eq!(None, lookup("x32"));
        assert_eq!(None, lookup("nonsense"));
    }

    #[test]
    fn test_csr_name_round_trip() {
        assert_eq!("mstatus", csr_name(csr::MSTATUS));
        assert_eq!("0x7c0", csr_name(0x7C0));
    }
}
