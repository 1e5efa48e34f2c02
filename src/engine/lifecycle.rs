/// Flags deciding whether the engine should be doing network work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleGate {
    started: bool,
    enabled: bool,
    foreground: bool,
}

/// What the engine must do after a gate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Tear down whatever is running and begin a fresh push-first attempt.
    Restart,
    /// Tear everything down; no network activity until reactivated.
    Shutdown,
    Unchanged,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self {
            started: false,
            enabled: true,
            foreground: true,
        }
    }
}

impl LifecycleGate {
    pub fn is_active(&self) -> bool {
        self.started && self.enabled && self.foreground
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    /// Calling `start` twice is a no-op the second time.
    pub fn start(&mut self) -> Transition {
        if self.started {
            return Transition::Unchanged;
        }
        self.started = true;
        self.activation()
    }

    pub fn stop(&mut self) -> Transition {
        if !self.started {
            return Transition::Unchanged;
        }
        self.started = false;
        Transition::Shutdown
    }

    pub fn enable(&mut self) -> Transition {
        if self.enabled {
            return Transition::Unchanged;
        }
        self.enabled = true;
        self.activation()
    }

    pub fn disable(&mut self) -> Transition {
        if !self.enabled {
            return Transition::Unchanged;
        }
        self.enabled = false;
        Transition::Shutdown
    }

    /// Every foreground transition restarts from scratch while active.
    pub fn foreground(&mut self) -> Transition {
        self.foreground = true;
        self.activation()
    }

    pub fn background(&mut self) -> Transition {
        let was_active = self.is_active();
        self.foreground = false;
        if was_active {
            Transition::Shutdown
        } else {
            Transition::Unchanged
        }
    }

    fn activation(&self) -> Transition {
        if self.is_active() {
            Transition::Restart
        } else {
            Transition::Unchanged
        }
    }
}
