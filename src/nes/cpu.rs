/// The CPU-visible address space as seen from the instruction interpreter.
pub trait CpuBus {
    /// `read_only` suppresses side effects such as register clears, for
    /// disassemblers and debuggers.
    fn read(&mut self, addr: u16, read_only: bool) -> u8;
    fn write(&mut self, addr: u16, data: u8);
}

/// Contract for the instruction interpreter. It owns no devices and reaches
/// memory only through the bus handed to each call.
pub trait Cpu {
    /// Advances one CPU cycle.
    fn clock(&mut self, bus: &mut dyn CpuBus);
    fn reset(&mut self, bus: &mut dyn CpuBus);
    /// Edge-triggered non-maskable interrupt.
    fn nmi(&mut self, bus: &mut dyn CpuBus);
    /// Level interrupt request; ignored while the I flag is set.
    fn irq(&mut self, bus: &mut dyn CpuBus);
    /// Monotonic count of executed instructions.
    fn instruction_count(&self) -> u64;
}
