use super::{OutputBase, OutputRule};
use crate::error::Result;
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::Aggregation;
use crate::logic::hub::RuleHub;
use crate::models::Table;

/// Aggregates each day with its neighbours: `past` days before, the day itself when
/// `current` is set, and `future` days after.
///
/// Near the start the window is clipped to the days available. Days without the full
/// future lookahead emit `0`.
#[derive(Debug)]
pub struct ApplyWindowing {
    base: OutputBase,
    past: usize,
    current: bool,
    future: usize,
    function: Aggregation,
}

impl ApplyWindowing {
    pub const NAME: &'static str = "ApplyWindowing";

    pub fn new(
        base: OutputBase,
        past: usize,
        current: bool,
        future: usize,
        function: Aggregation,
    ) -> Result<Self> {
        base.target(Self::NAME)?;
        Ok(Self {
            base,
            past,
            current,
            future,
            function,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let past = args.opt_usize("window_past")?.unwrap_or(0);
        let current = args.opt_usize("window_current")?.unwrap_or(1) > 0;
        let future = args.opt_usize("window_future")?.unwrap_or(0);
        let function = match args.opt_str("function")? {
            Some(f) => Aggregation::parse(&f)?,
            None => Aggregation::Sum,
        };
        let base = OutputBase::from_args(args)?;
        Self::new(base, past, current, future, function)
    }

    pub fn window(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        (0..n)
            .map(|i| {
                let last = match i.checked_add(self.future) {
                    Some(last) if last < n => last,
                    _ => return 0.0,
                };
                let mut window: Vec<f64> = values[i.saturating_sub(self.past)..i].to_vec();
                if self.current {
                    window.push(values[i]);
                }
                window.extend_from_slice(&values[i + 1..=last]);
                self.function.apply(&window)
            })
            .collect()
    }
}

impl OutputRule for ApplyWindowing {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn column(&self) -> &str {
        &self.base.column
    }

    fn apply(&self, table: &Table, _hub: &mut RuleHub) -> Result<(Table, Table)> {
        let target = self.base.target(Self::NAME)?;
        let daily = self.base.daily_values(table, target)?;
        self.base.emit(table, self.window(&daily))
    }
}
