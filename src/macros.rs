//! # Internal Macros
//!
//! Accessor generation for persisted structs. Every on-disk struct in Arbor
//! stores multi-byte fields as `zerocopy` little-endian wrappers so pages
//! parse on any host; the macro below produces the `field()` / `set_field()`
//! pairs that convert at the boundary.
//!
//! ```ignore
//! use zerocopy::little_endian::U32;
//!
//! #[repr(C)]
//! struct Header {
//!     size: U32,
//!     parent_page_id: U32,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         size: u32,
//!         parent_page_id: u32,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy little-endian `U32`
/// fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    ($($field:ident : u32),* $(,)?) => {
        $(
            ::paste::paste! {
                #[inline]
                pub fn $field(&self) -> u32 {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: u32) {
                    self.$field = ::zerocopy::little_endian::U32::new(val);
                }
            }
        )*
    };
}
