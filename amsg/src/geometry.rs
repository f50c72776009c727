//! Core and locale numbering.
//!
//! Cores of one locale are numbered contiguously: with `L` cores per locale,
//! core `c` lives in locale `c / L` as locale-core `c % L`. Every core
//! computes the same table from `(cores, locale_size)` alone.

use std::ops::Range;

use crate::error::{Error, Result};

/// Dense process id, stable for the lifetime of the job.
pub type Core = usize;

/// Group of co-located cores sharing one node's memory.
pub type Locale = usize;

/// Job-wide core-to-locale table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    cores: usize,
    locale_size: usize,
}

impl Geometry {
    pub fn new(cores: usize, locale_size: usize) -> Result<Self> {
        if cores == 0 || locale_size == 0 {
            return Err(Error::InvalidGeometry(format!(
                "{cores} cores with {locale_size} cores per locale"
            )));
        }
        if !cores.is_multiple_of(locale_size) {
            return Err(Error::InvalidGeometry(format!(
                "{cores} cores do not divide into locales of {locale_size}"
            )));
        }
        Ok(Self { cores, locale_size })
    }

    /// Total cores in the job.
    #[inline]
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Cores per locale.
    #[inline]
    pub fn locale_size(&self) -> usize {
        self.locale_size
    }

    /// Number of locales in the job.
    #[inline]
    pub fn locales(&self) -> usize {
        self.cores / self.locale_size
    }

    #[inline]
    pub fn locale_of(&self, core: Core) -> Locale {
        core / self.locale_size
    }

    /// Index of `core` within its locale.
    #[inline]
    pub fn locale_core_of(&self, core: Core) -> usize {
        core % self.locale_size
    }

    /// Cores belonging to `locale`.
    pub fn cores_of(&self, locale: Locale) -> Range<Core> {
        let start = locale * self.locale_size;
        start..start + self.locale_size
    }

    /// Whether two cores can share raw pointers into the locale heap.
    #[inline]
    pub fn same_locale(&self, a: Core, b: Core) -> bool {
        self.locale_of(a) == self.locale_of(b)
    }

    pub fn check_core(&self, core: Core) -> Result<()> {
        if core < self.cores {
            Ok(())
        } else {
            Err(Error::InvalidCore {
                core,
                cores: self.cores,
            })
        }
    }
}
