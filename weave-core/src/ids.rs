//! Fabric-wide identifiers: node, fabric, message, exchange and key ids.

use core::fmt;

/// 64-bit identity of a device within a fabric.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// All-ones sentinel matching any node.
    pub const ANY: Self = Self(u64::MAX);
    /// Zero sentinel meaning "not specified".
    pub const NOT_SPECIFIED: Self = Self(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_any(self) -> bool {
        self.0 == Self::ANY.0
    }

    #[inline]
    pub const fn is_specified(self) -> bool {
        self.0 != Self::NOT_SPECIFIED.0
    }

    /// Matches against `Self::ANY` or an exact node id, as used when scanning
    /// unsolicited-handler and exchange-context pools for a peer.
    #[inline]
    pub fn matches(self, other: NodeId) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:016x})", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 64-bit identity of a fabric (a set of devices sharing a key hierarchy).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FabricId(u64);

impl FabricId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FabricId({:016x})", self.0)
    }
}

impl From<u64> for FabricId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A 32-bit monotonically-increasing message counter, scoped per (source node, key).
///
/// Comparisons account for wraparound: `a.is_after(b)` is true whenever `a`
/// sits within the forward half of the 32-bit ring relative to `b`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(u32);

impl MessageId {
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// True if `self` is strictly newer than `other` under wraparound
    /// arithmetic (i.e. the signed difference is positive).
    #[inline]
    pub fn is_after(self, other: Self) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:08x})", self.0)
    }
}

impl From<u32> for MessageId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Minimum width of the duplicate-detection window, in message ids (`W >= 32`).
pub const MIN_DUPLICATE_WINDOW: u32 = 32;

/// A window-based duplicate detector over the most recently observed message
/// ids from a single (source node, key) pair. Handles 32-bit wraparound by
/// tracking a `highest` id and a bitmask of the `width` ids below it.
#[derive(Clone, Debug)]
pub struct DuplicateWindow {
    width: u32,
    highest: Option<MessageId>,
    seen: u64,
}

impl DuplicateWindow {
    pub fn new(width: u32) -> Self {
        assert!(width >= MIN_DUPLICATE_WINDOW, "window must be >= 32 ids wide");
        assert!(width <= 64, "window implementation is bitmask-backed up to 64 ids");
        Self {
            width,
            highest: None,
            seen: 0,
        }
    }

    /// Records `id`, returning `true` if it had already been observed
    /// (a duplicate) or falls below the trailing edge of the window (stale).
    pub fn check_and_record(&mut self, id: MessageId) -> bool {
        let highest = match self.highest {
            None => {
                self.highest = Some(id);
                self.seen = 1;
                return false;
            }
            Some(h) => h,
        };

        if id.is_after(highest) {
            let shift = id.as_u32().wrapping_sub(highest.as_u32());
            self.seen = if shift >= self.width {
                1
            } else {
                (self.seen << shift) | 1
            };
            self.highest = Some(id);
            false
        } else if id == highest {
            let was_dup = self.seen & 1 != 0;
            self.seen |= 1;
            was_dup
        } else {
            let age = highest.as_u32().wrapping_sub(id.as_u32());
            if age >= self.width {
                // Outside the trailing window: treat as stale/duplicate.
                true
            } else {
                let bit = 1u64 << age;
                let was_dup = self.seen & bit != 0;
                self.seen |= bit;
                was_dup
            }
        }
    }
}

/// 16-bit exchange identifier, chosen by the initiator and unique within the
/// (peer node, connection-or-UDP, is-initiator) tuple while the exchange lives.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(u16);

impl ExchangeId {
    #[inline]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangeId({:04x})", self.0)
    }
}

impl From<u16> for ExchangeId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// 32-bit profile identifier: upper 16 bits are the vendor id, lower 16 bits
/// are the profile number within that vendor's namespace.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileId(u32);

impl ProfileId {
    pub const COMMON: Self = Self(0x0000_0000);

    #[inline]
    pub const fn new(vendor: u16, profile_number: u16) -> Self {
        Self(((vendor as u32) << 16) | profile_number as u32)
    }

    #[inline]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn vendor(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub const fn profile_number(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileId({:08x})", self.0)
    }
}

/// 16-bit message-encryption key identifier. `None` means the message is
/// sent in the clear.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyId(Option<u16>);

impl KeyId {
    pub const NONE: Self = Self(None);

    #[inline]
    pub const fn new(value: u16) -> Self {
        Self(Some(value))
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0.is_none()
    }

    #[inline]
    pub const fn raw(self) -> Option<u16> {
        self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "KeyId({v:04x})"),
            None => write!(f, "KeyId(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_any_matches_everything() {
        let a = NodeId::ANY;
        let b = NodeId::new(42);
        assert!(a.matches(b));
        assert!(b.matches(a));
        assert!(!NodeId::new(1).matches(NodeId::new(2)));
    }

    #[test]
    fn message_id_wraparound_ordering() {
        let near_max = MessageId::new(u32::MAX - 1);
        let wrapped = near_max.next().next();
        assert!(wrapped.is_after(near_max));
    }

    #[test]
    fn duplicate_window_flags_repeats() {
        let mut window = DuplicateWindow::new(32);
        assert!(!window.check_and_record(MessageId::new(10)));
        assert!(window.check_and_record(MessageId::new(10)));
        assert!(!window.check_and_record(MessageId::new(11)));
        // moving the high-water mark forward should still catch an old repeat
        assert!(!window.check_and_record(MessageId::new(12)));
        assert!(window.check_and_record(MessageId::new(11)));
    }

    #[test]
    fn duplicate_window_treats_stale_ids_as_duplicate() {
        let mut window = DuplicateWindow::new(32);
        window.check_and_record(MessageId::new(1000));
        assert!(window.check_and_record(MessageId::new(900)));
    }

    #[test]
    fn profile_id_splits_vendor_and_number() {
        let id = ProfileId::new(0x0001, 0x000F);
        assert_eq!(id.vendor(), 1);
        assert_eq!(id.profile_number(), 0x000F);
        assert_eq!(id.as_u32(), 0x0001_000F);
    }
}
