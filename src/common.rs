use thiserror::Error;

/// Default half-width increment applied before each buffer growth step.
pub static DEFAULT_BUFFER_INCREMENT: f64 = 100.0;
/// Default multiplier applied after the increment on each growth step.
pub static DEFAULT_BUFFER_GROWTH: f64 = 2.0;
/// Default bound on subgraph expansion attempts per POI.
pub static DEFAULT_MAX_EXPANSION_ATTEMPTS: usize = 10;
/// Default number of routes reconstructed per POI.
pub static DEFAULT_NUM_ROUTES: usize = 5;

/// Errors raised by the routing engine.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// Structural input failure. Fatal for the affected operation and raised
    /// before any per-POI work begins.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Buffer growth exceeded the retry bound for a single POI. The batch
    /// recovers by skipping that POI.
    #[error(
        "subgraph expansion exceeded {attempts} attempts for POI '{poi_id}' \
         (final buffer {buffer})"
    )]
    SubgraphExpansionExceeded {
        poi_id: String,
        attempts: usize,
        buffer: f64,
    },
}

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Tunable parameters for subgraph extraction and route reconstruction.
///
/// Passed explicitly into the engine at construction time rather than read
/// from any global state.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Added to the buffer before each growth step.
    pub buffer_increment: f64,
    /// Multiplier applied to the incremented buffer on each growth step.
    pub buffer_growth: f64,
    /// Hard bound on extraction attempts per POI.
    pub max_expansion_attempts: usize,
    /// When true, a subgraph is only accepted once every required reference
    /// node is actually reachable from the POI's node. When false, only the
    /// cheaper containment check is applied; containment is a necessary but
    /// not sufficient condition for reachability.
    pub require_reachability: bool,
    /// Number of routes reconstructed per POI when routes are requested.
    pub num_routes: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            buffer_increment: DEFAULT_BUFFER_INCREMENT,
            buffer_growth: DEFAULT_BUFFER_GROWTH,
            max_expansion_attempts: DEFAULT_MAX_EXPANSION_ATTEMPTS,
            require_reachability: true,
            num_routes: DEFAULT_NUM_ROUTES,
        }
    }
}

impl RoutingConfig {
    /// Checks that the growth parameters can actually enlarge the buffer.
    pub fn validate(&self) -> Result<()> {
        if !self.buffer_increment.is_finite() || self.buffer_increment < 0.0 {
            return Err(RoutingError::InvalidInput(format!(
                "buffer_increment must be finite and non-negative, got {}",
                self.buffer_increment
            )));
        }
        if !self.buffer_growth.is_finite() || self.buffer_growth < 1.0 {
            return Err(RoutingError::InvalidInput(format!(
                "buffer_growth must be finite and at least 1.0, got {}",
                self.buffer_growth
            )));
        }
        if self.buffer_increment == 0.0 && self.buffer_growth == 1.0 {
            return Err(RoutingError::InvalidInput(
                "buffer_increment 0.0 with buffer_growth 1.0 can never enlarge the buffer"
                    .to_string(),
            ));
        }
        if self.max_expansion_attempts == 0 {
            return Err(RoutingError::InvalidInput(
                "max_expansion_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// One buffer growth step: `(buffer + increment) * growth`.
    #[inline]
    pub fn grow_buffer(&self, buffer: f64) -> f64 {
        (buffer + self.buffer_increment) * self.buffer_growth
    }
}
