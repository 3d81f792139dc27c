/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Operation context**, designated by the user when posting an
/// operation and handed back untouched in the matching completion.
pub type OpContext = u64;

/// [`u32`]: **Immediate data**, carried alongside a send or write and
/// delivered to the receiver's completion.
pub type ImmData = u32;
