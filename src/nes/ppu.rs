use super::cartridge::Cartridge;

/// Contract for the picture unit. Pattern fetches and nametable layout go
/// through the cartridge passed into each call, and a rendered scanline is
/// reported with `Cartridge::scanline`.
pub trait Ppu {
    /// Advances one dot.
    fn clock(&mut self, cart: &mut Cartridge);
    /// `reg` is already folded into 0..=7.
    fn cpu_read(&mut self, reg: u16, read_only: bool, cart: &mut Cartridge) -> u8;
    fn cpu_write(&mut self, reg: u16, data: u8, cart: &mut Cartridge);
    fn connect_cartridge(&mut self, _cart: &Cartridge) {}
    fn reset(&mut self) {}
    /// Returns and clears the vblank NMI edge.
    fn take_nmi(&mut self) -> bool;
    fn frame_complete(&self) -> bool;
    fn clear_frame_complete(&mut self);
}
