use bitfield_struct::bitfield;

/// Page-fault error code pushed by the CPU on `#PF`.
///
/// Reference: Intel SDM Vol. 3A, §6.15, "Page-Fault Exception".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// 0 = supervisor, 1 = user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultErrorCode {
    /// A one-line description for fault diagnostics.
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            if self.write() {
                "Write to non-present page"
            } else {
                "Read or fetch from non-present page"
            }
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    /// A not-present fault is the only kind that demand paging can resolve.
    #[inline]
    #[must_use]
    pub const fn is_not_present(&self) -> bool {
        !self.present() && !self.reserved_bit()
    }
}
