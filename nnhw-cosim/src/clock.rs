//! Simulation time.
//!
//! The verifier never counts cycles itself; it asks a [`Clock`]. Tests inject
//! clocks that skip ahead to reach the timeout without simulating every edge.

pub trait Clock {
    /// Advance one rising edge and return the new cycle count.
    fn tick(&mut self) -> u64;

    fn cycles(&self) -> u64;
}

/// One cycle per edge.
#[derive(Debug, Default, Clone)]
pub struct CycleClock {
    cycles: u64,
}

impl CycleClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for CycleClock {
    fn tick(&mut self) -> u64 {
        self.cycles += 1;
        self.cycles
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl<C: Clock + ?Sized> Clock for &mut C {
    fn tick(&mut self) -> u64 {
        (**self).tick()
    }

    fn cycles(&self) -> u64 {
        (**self).cycles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_edges() {
        let mut clock = CycleClock::new();
        assert_eq!(clock.cycles(), 0);
        clock.tick();
        assert_eq!(clock.tick(), 2);
        fn advance<C: Clock>(mut clock: C) {
            clock.tick();
        }
        advance(&mut clock);
        assert_eq!(clock.cycles(), 3);
    }
}
