use desman_core::{bail, Result};

// AccelConfig — static device configuration, fixed at bring-up
//
// Usage:
//
//   let device = AccelDevice::new(
//       AccelConfig::default()
//           .active_banks(4)
//           .port_width(16)
//           .crossing_capacity(1 << 16)
//           .profiling(true),
//   )?;
//
// Bank assignment is a configuration-time decision; nothing is load-balanced
// at runtime.

/// Largest bank count any accelerator board exposes.
pub const MAX_BANKS: usize = 4;

/// Per-operator-class bank assignment.
///
/// Operands are crossed to the bank of the class that executes them, and the
/// result is allocated there too, so repeated invocations of one class never
/// pay a crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankPlan {
    /// Bank read and written by the elementwise and data-movement operators.
    pub elementwise: usize,
    /// Bank for the matrix-multiply unit.
    pub matmul: usize,
    /// Bank for the convolution unit.
    pub conv: usize,
    /// Bank host uploads land in by default.
    pub io: usize,
}

impl Default for BankPlan {
    fn default() -> Self {
        BankPlan {
            elementwise: 0,
            matmul: 0,
            conv: 0,
            io: 0,
        }
    }
}

impl BankPlan {
    pub fn elementwise(mut self, bank: usize) -> Self {
        self.elementwise = bank;
        self
    }
    pub fn matmul(mut self, bank: usize) -> Self {
        self.matmul = bank;
        self
    }
    pub fn conv(mut self, bank: usize) -> Self {
        self.conv = bank;
        self
    }
    pub fn io(mut self, bank: usize) -> Self {
        self.io = bank;
        self
    }

    fn max_bank(&self) -> usize {
        self.elementwise
            .max(self.matmul)
            .max(self.conv)
            .max(self.io)
    }
}

/// Configuration for an [`AccelDevice`](crate::AccelDevice).
#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Accelerator image selector. Purely diagnostic on the device model but
    /// kept in the configuration surface.
    pub image: String,
    /// Number of active memory banks, in [1, MAX_BANKS].
    pub active_banks: usize,
    /// Port width W: every physical last dimension is a multiple of this.
    pub port_width: usize,
    /// Capacity, in 32-bit lanes, of each broker placeholder buffer. Bounds
    /// the largest tensor a bank crossing can move.
    pub crossing_capacity: usize,
    /// Whether dispatches report completion to the profiling sink and clear
    /// their bookkeeping entries automatically.
    pub profiling: bool,
    /// Log every bank crossing at debug level.
    pub log_crossings: bool,
    /// Per-operator-class bank assignment.
    pub banks: BankPlan,
}

impl Default for AccelConfig {
    fn default() -> Self {
        AccelConfig {
            image: "desman-default".to_string(),
            active_banks: 4,
            port_width: 16,
            crossing_capacity: 1 << 16,
            profiling: false,
            log_crossings: false,
            banks: BankPlan::default(),
        }
    }
}

impl AccelConfig {
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }
    pub fn active_banks(mut self, n: usize) -> Self {
        self.active_banks = n;
        self
    }
    pub fn port_width(mut self, w: usize) -> Self {
        self.port_width = w;
        self
    }
    pub fn crossing_capacity(mut self, lanes: usize) -> Self {
        self.crossing_capacity = lanes;
        self
    }
    pub fn profiling(mut self, on: bool) -> Self {
        self.profiling = on;
        self
    }
    pub fn log_crossings(mut self, on: bool) -> Self {
        self.log_crossings = on;
        self
    }
    pub fn bank_plan(mut self, plan: BankPlan) -> Self {
        self.banks = plan;
        self
    }

    /// Validate the configuration at device bring-up.
    pub fn validate(&self) -> Result<()> {
        if self.active_banks == 0 || self.active_banks > MAX_BANKS {
            bail!(
                "config: active_banks must be in [1, {}], got {}",
                MAX_BANKS,
                self.active_banks
            );
        }
        if self.port_width == 0 {
            bail!("config: port_width must be at least 1");
        }
        if self.crossing_capacity == 0 {
            bail!("config: crossing_capacity must be at least 1");
        }
        if self.banks.max_bank() >= self.active_banks {
            bail!(
                "config: bank plan references bank {} but only {} bank(s) are active",
                self.banks.max_bank(),
                self.active_banks
            );
        }
        Ok(())
    }
}
