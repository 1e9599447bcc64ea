//! Mode/session controller — reconciles independent disable requesters.
//!
//! Several sources (user toggle, concurrency policy, scan, external
//! control) may each demand TDLS off. No source can silently override
//! another: the effective mode only leaves `Disabled` once every asserted
//! source has cleared its bit.

use serde::Serialize;

/// Effective operating mode of the whole device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TdlsMode {
    Disabled,
    /// No traffic-driven link establishment; only explicit setup requests.
    ExplicitTriggerOnly,
    /// The tracker autonomously establishes and tears down links.
    Implicit,
    /// Establishment is gated on the externally supplied forced-peer list.
    ExternalControl,
}

impl TdlsMode {
    pub fn enabled(self) -> bool {
        self != TdlsMode::Disabled
    }
}

/// Independent requesters that can force the effective mode to `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableSource {
    User,
    Concurrency,
    Scan,
    ExternalControl,
}

impl DisableSource {
    fn bit(self) -> u8 {
        match self {
            DisableSource::User => 1 << 0,
            DisableSource::Concurrency => 1 << 1,
            DisableSource::Scan => 1 << 2,
            DisableSource::ExternalControl => 1 << 3,
        }
    }
}

/// What a mode request actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub old: TdlsMode,
    pub new: TdlsMode,
}

impl ModeChange {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }

    /// Effective mode left `Disabled`.
    pub fn went_up(&self) -> bool {
        !self.old.enabled() && self.new.enabled()
    }

    /// Effective mode entered `Disabled`.
    pub fn went_down(&self) -> bool {
        self.old.enabled() && !self.new.enabled()
    }
}

/// The reconciler. Pure state — the engine applies the side effects a
/// [`ModeChange`] calls for (timer start/stop, teardown-all, firmware push).
#[derive(Debug)]
pub struct ModeController {
    effective: TdlsMode,
    /// Restored when the last disable source clears.
    last_enabled: TdlsMode,
    disable_bits: u8,
}

impl ModeController {
    pub fn new(initial: TdlsMode) -> Self {
        Self {
            effective: initial,
            last_enabled: if initial.enabled() { initial } else { TdlsMode::Implicit },
            disable_bits: 0,
        }
    }

    pub fn effective(&self) -> TdlsMode {
        self.effective
    }

    pub fn is_enabled(&self) -> bool {
        self.effective.enabled()
    }

    /// Raw bitmask of asserted sources, for diagnostics.
    pub fn disable_bits(&self) -> u8 {
        self.disable_bits
    }

    /// A source requests a mode.
    ///
    /// `Disabled` asserts the source's bit and forces the effective mode
    /// down. Anything else clears the source's bit — but the effective mode
    /// only comes back up once no bit remains set.
    pub fn request(&mut self, mode: TdlsMode, source: DisableSource) -> ModeChange {
        let old = self.effective;
        if mode == TdlsMode::Disabled {
            self.disable_bits |= source.bit();
            self.effective = TdlsMode::Disabled;
        } else {
            self.disable_bits &= !source.bit();
            self.last_enabled = mode;
            self.effective = if self.disable_bits == 0 { mode } else { TdlsMode::Disabled };
        }
        ModeChange { old, new: self.effective }
    }

    /// Shorthand: assert `source` without changing the remembered mode.
    pub fn assert_disable(&mut self, source: DisableSource) -> ModeChange {
        self.request(TdlsMode::Disabled, source)
    }

    /// Clear `source` and restore the last non-disabled mode if no other
    /// source is still asserted.
    pub fn clear(&mut self, source: DisableSource) -> ModeChange {
        let old = self.effective;
        self.disable_bits &= !source.bit();
        if self.disable_bits == 0 {
            self.effective = self.last_enabled;
        }
        ModeChange { old, new: self.effective }
    }
}
