// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The contract the engine requires of an IOMMU-like address mapper.

/// An IOMMU-like translation agent between device-visible addresses and host
/// physical addresses.
///
/// Window reservations are expressed in 4KB pages; `base` values are page
/// frame numbers in the device's address space.
pub trait DmaMapper: Send + Sync {
    /// Reserves a window of `pages` I/O virtual pages for one command.
    ///
    /// Returns the base page frame number of the window, or `None` if the
    /// mapper cannot reserve the window.
    fn alloc_window(&self, pages: u64) -> Option<u64>;

    /// Reserves a window of `pages` I/O virtual pages for one command and
    /// programs it to translate to the physically contiguous run starting
    /// at page `base`, used to map a substituted bounce buffer.
    ///
    /// Returns the base page frame number of the window, or `None` if the
    /// mapper cannot establish the mapping.
    fn map_range(&self, base: u64, pages: u64) -> Option<u64>;

    /// Releases a window reserved with [`Self::alloc_window`] or
    /// [`Self::map_range`].
    fn free_window(&self, base: u64, pages: u64);

    /// Releases an I/O virtual range recorded by a memory descriptor's
    /// mapping rather than by a command-local reservation.
    fn iovm_free(&self, base: u64, pages: u64);

    /// Translates a device-visible address to a host physical address.
    fn map_addr(&self, addr: u64) -> u64;

    /// The address bits a bypassed transfer must carry, or `None` if the
    /// mapper cannot be bypassed.
    fn bypass_mask(&self) -> Option<u64>;
}

/// An opaque device identity forwarded to the memory descriptor when a
/// mapping is requested, used for mapper policy and attribution.
pub trait MapperDevice: Send + Sync {
    /// A diagnostic name for the device.
    fn name(&self) -> &str;
}
