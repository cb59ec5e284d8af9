//! Utilities used in this crate.
//!
//! This is not part of the public interface of the crate.

use lazy_static::lazy_static;

/// Generate a consuming setter for a builder field.
macro_rules! builder_pattern {
    ($(#[$outer:meta])* $var_name: ident : $var_type: ty) => {
        builder_pattern!($(#[$outer])* $var_name => $var_name: $var_type);
    };
    ($(#[$outer:meta])* $name: ident => $var_name: ident : $var_type: ty) => {
        $(#[$outer])*
        pub fn $name(mut self, $var_name: $var_type) -> Self {
            self.$var_name = $var_name;
            self
        }
    };
}

/// Generate a consuming setter that switches a boolean builder field on.
macro_rules! builder_pattern_bool {
    ($(#[$outer:meta])* $var_name: ident) => {
        builder_pattern_bool!($(#[$outer])* $var_name => $var_name);
    };
    ($(#[$outer:meta])* $name: ident => $var_name: ident) => {
        $(#[$outer])*
        pub fn $name(mut self) -> Self {
            self.$var_name = true;
            self
        }
    };
}

lazy_static! {
    /// Host page size, as reported by `sysconf`.
    pub static ref PAGE_SIZE: usize = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .and_then(|v| v)
        .map(|v| v as usize)
        .unwrap_or(4096);
}
