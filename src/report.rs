//! Structured outcome of one acceptance-test run.

use serde::Serialize;

use crate::store::PhaseCurrents;

/// Classification of one leg of the regulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PhaseVerdict {
    #[default]
    #[serde(rename = "OK")]
    Ok,
    /// The device on this leg does not conduct.
    DeviceOpen,
    /// Reserved: no measurement currently produces it.
    DeviceShortCircuit,
    /// The leg carries markedly less current than the others.
    PhaseOpen,
}

impl PhaseVerdict {
    pub fn is_fault(&self) -> bool {
        *self != PhaseVerdict::Ok
    }

    pub fn description(&self) -> &'static str {
        match self {
            PhaseVerdict::Ok => "device OK",
            PhaseVerdict::DeviceOpen => "device not conducting/open",
            PhaseVerdict::DeviceShortCircuit => "device short-circuited",
            PhaseVerdict::PhaseOpen => "phase open",
        }
    }
}

/// Verdicts for legs A, B and C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PhaseVerdicts {
    pub a: PhaseVerdict,
    pub b: PhaseVerdict,
    pub c: PhaseVerdict,
}

impl PhaseVerdicts {
    pub fn from_array([a, b, c]: [PhaseVerdict; 3]) -> Self {
        Self { a, b, c }
    }

    pub fn to_array(self) -> [PhaseVerdict; 3] {
        [self.a, self.b, self.c]
    }

    pub fn any_fault(&self) -> bool {
        self.to_array().iter().any(PhaseVerdict::is_fault)
    }
}

/// State of a run; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Outcome {
    #[default]
    Pending,
    Running,
    Pass,
    Fail,
    Aborted,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Fail | Outcome::Aborted)
    }
}

/// Windowed mean current statistics of one sub-test. `None` marks a value that
/// could not be computed (empty or degenerate sampling window).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CurrentStats {
    #[serde(rename = "IaRMS")]
    pub ia_rms: Option<f64>,
    #[serde(rename = "IbRMS")]
    pub ib_rms: Option<f64>,
    #[serde(rename = "IcRMS")]
    pub ic_rms: Option<f64>,
    #[serde(rename = "IaAVG")]
    pub ia_avg: Option<f64>,
    #[serde(rename = "IbAVG")]
    pub ib_avg: Option<f64>,
    #[serde(rename = "IcAVG")]
    pub ic_avg: Option<f64>,
}

impl CurrentStats {
    pub fn from_means(means: &PhaseCurrents) -> Self {
        Self {
            ia_rms: Some(means.a.rms),
            ib_rms: Some(means.b.rms),
            ic_rms: Some(means.c.rms),
            ia_avg: Some(means.a.avg),
            ib_avg: Some(means.b.avg),
            ic_avg: Some(means.c.avg),
        }
    }

    fn values_mut(&mut self) -> [&mut Option<f64>; 6] {
        [
            &mut self.ia_rms,
            &mut self.ib_rms,
            &mut self.ic_rms,
            &mut self.ia_avg,
            &mut self.ib_avg,
            &mut self.ic_avg,
        ]
    }
}

/// Everything a run measured and decided.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TestResult {
    pub profile: String,
    /// Phase-loss sub-test.
    #[serde(rename = "currents_1")]
    pub phase_loss_currents: Option<CurrentStats>,
    #[serde(rename = "states_1")]
    pub phase_loss_verdicts: Option<PhaseVerdicts>,
    /// Conduction sub-test.
    #[serde(rename = "currents_2")]
    pub conduction_currents: Option<CurrentStats>,
    #[serde(rename = "states_2")]
    pub conduction_verdicts: Option<PhaseVerdicts>,
    /// Mean output voltage of the regulation sub-test, volts.
    #[serde(rename = "vout")]
    pub output_voltage: Option<f64>,
    pub outcome: Outcome,
    pub message: String,
}

impl TestResult {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            ..Self::default()
        }
    }

    /// Replace every non-finite number with `None`.
    pub fn sanitize(&mut self) {
        fn clean(value: &mut Option<f64>) {
            if value.is_some_and(|v| !v.is_finite()) {
                *value = None;
            }
        }

        for stats in [&mut self.phase_loss_currents, &mut self.conduction_currents]
            .into_iter()
            .flatten()
        {
            for value in stats.values_mut() {
                clean(value);
            }
        }
        clean(&mut self.output_voltage);
    }

    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }

    /// Latest leg verdicts available.
    pub fn final_verdicts(&self) -> Option<PhaseVerdicts> {
        self.conduction_verdicts.or(self.phase_loss_verdicts)
    }
}
