//! Bounded configuration values.

use core::fmt;
use std::cmp;

use tracing::debug;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a named config variable.
#[derive(Clone, Copy)]
pub struct DefMinMax<T> {
    /// The name of the variable for log messages.
    name: &'static str,

    /// The default value.
    def: T,

    /// The minimum value.
    min: T,

    /// The maximum value.
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(name: &'static str, def: T, min: T, max: T) -> Self {
        Self {
            name,
            def,
            min,
            max,
        }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    ///
    /// A value that had to be trimmed is logged.
    pub fn limit(self, value: T) -> T
    where
        T: Ord + Copy + fmt::Debug,
    {
        let res = cmp::max(self.min, cmp::min(self.max, value));
        if res != value {
            debug!("{} of {:?} out of range, using {:?}", self.name, value, res);
        }
        res
    }
}

//============ Tests =========================================================
