//! Device selection.
use std::str::FromStr;

use candle_core::Device;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum DeviceError {
    #[snafu(display("Unknown device '{spec}', expected cpu, cuda[:N] or metal[:N]"))]
    Unknown { spec: String },

    #[snafu(display("Cannot parse device ordinal '{ordinal}'"))]
    Ordinal {
        ordinal: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("Cannot create device '{spec}'"))]
    Create {
        spec: DeviceSpec,
        source: candle_core::Error,
    },
}

/// Device given on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Create the device.
    pub fn device(self) -> Result<Device, DeviceError> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal),
        }
        .context(CreateSnafu { spec: self })
    }
}

impl FromStr for DeviceSpec {
    type Err = DeviceError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim().to_lowercase();
        let (name, ordinal) = match spec.split_once(':') {
            Some((name, ordinal)) => (
                name,
                ordinal.parse().context(OrdinalSnafu { ordinal })?,
            ),
            None => (spec.as_str(), 0),
        };

        match name {
            "cpu" if ordinal == 0 => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" => Ok(DeviceSpec::Metal(ordinal)),
            _ => UnknownSnafu { spec: &spec }.fail(),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use rstest::rstest;

    use super::DeviceSpec;

    #[rstest]
    #[case("cpu", DeviceSpec::Cpu)]
    #[case(" CPU ", DeviceSpec::Cpu)]
    #[case("cuda", DeviceSpec::Cuda(0))]
    #[case("cuda:1", DeviceSpec::Cuda(1))]
    #[case("metal", DeviceSpec::Metal(0))]
    fn parses_devices(#[case] spec: &str, #[case] expected: DeviceSpec) {
        assert_eq!(spec.parse::<DeviceSpec>().unwrap(), expected);
    }

    #[rstest]
    #[case("tpu")]
    #[case("cuda:x")]
    #[case("cpu:1")]
    #[case("")]
    fn rejects_unknown_devices(#[case] spec: &str) {
        assert!(spec.parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let spec = DeviceSpec::Cuda(2);
        assert_eq!(spec.to_string().parse::<DeviceSpec>().unwrap(), spec);
    }

    #[test]
    fn creates_cpu_device() {
        assert!(matches!(DeviceSpec::Cpu.device().unwrap(), Device::Cpu));
    }
}
