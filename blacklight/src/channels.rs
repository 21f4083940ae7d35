// Image-channel selection and the derived channel schema
//
// Channel offsets are never written by hand: the schema is an ordered list
// of records from which offsets follow deterministically.

use crate::camera::FrequencyNormalization;

// Which image quantities a run produces
#[derive(Debug, Clone)]
pub struct ImageSettings {
    // Observed frequency in Hz
    pub frequency: f64,
    pub normalization: FrequencyNormalization,
    pub light: bool,
    pub polarization: bool,
    pub time: bool,
    pub length: bool,
    pub lambda: bool,
    pub emission: bool,
    pub tau: bool,
    pub lambda_ave: bool,
    pub emission_ave: bool,
    pub tau_int: bool,
    pub z_turnings: bool,
    // Skip emission behind this many line-of-sight turning points
    pub cut_z_turnings: Option<u32>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            frequency: 2.3e11,
            normalization: FrequencyNormalization::Camera,
            light: true,
            polarization: false,
            time: false,
            length: false,
            lambda: false,
            emission: false,
            tau: false,
            lambda_ave: false,
            emission_ave: false,
            tau_int: false,
            z_turnings: false,
            cut_z_turnings: None,
        }
    }
}

impl ImageSettings {
    // A run with nothing selected has nothing to do
    pub fn any_selected(&self) -> bool {
        self.light
            || self.time
            || self.length
            || self.lambda
            || self.emission
            || self.tau
            || self.lambda_ave
            || self.emission_ave
            || self.tau_int
            || self.z_turnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Intensity,
    StokesQ,
    StokesU,
    StokesV,
    Time,
    Length,
    Lambda,
    Emission,
    Tau,
    // Weighted means of a model cell value; payload indexes the model's
    // cell-value list
    LambdaAve(usize),
    EmissionAve(usize),
    TauInt(usize),
    ZTurnings,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelKind,
    pub name: String,
}

// Ordered channel list; a channel's offset is its position
#[derive(Debug, Clone, Default)]
pub struct ChannelSchema {
    channels: Vec<Channel>,
}

impl ChannelSchema {
    pub fn build(image: &ImageSettings, cell_value_names: &[String]) -> Self {
        let mut channels = Vec::new();
        let mut push = |kind: ChannelKind, name: String| {
            channels.push(Channel { kind, name });
        };

        if image.light {
            push(ChannelKind::Intensity, "I".to_string());
            if image.polarization {
                push(ChannelKind::StokesQ, "Q".to_string());
                push(ChannelKind::StokesU, "U".to_string());
                push(ChannelKind::StokesV, "V".to_string());
            }
        }
        if image.time {
            push(ChannelKind::Time, "time".to_string());
        }
        if image.length {
            push(ChannelKind::Length, "length".to_string());
        }
        if image.lambda {
            push(ChannelKind::Lambda, "lambda".to_string());
        }
        if image.emission {
            push(ChannelKind::Emission, "emission".to_string());
        }
        if image.tau {
            push(ChannelKind::Tau, "tau".to_string());
        }
        if image.lambda_ave {
            for (c, name) in cell_value_names.iter().enumerate() {
                push(ChannelKind::LambdaAve(c), format!("lambda_ave_{name}"));
            }
        }
        if image.emission_ave {
            for (c, name) in cell_value_names.iter().enumerate() {
                push(ChannelKind::EmissionAve(c), format!("emission_ave_{name}"));
            }
        }
        if image.tau_int {
            for (c, name) in cell_value_names.iter().enumerate() {
                push(ChannelKind::TauInt(c), format!("tau_int_{name}"));
            }
        }
        if image.z_turnings {
            push(ChannelKind::ZTurnings, "z_turnings".to_string());
        }

        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn offset(&self, kind: &ChannelKind) -> Option<usize> {
        self.channels.iter().position(|c| &c.kind == kind)
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_selection_order() {
        let image = ImageSettings {
            light: true,
            tau: true,
            time: true,
            ..ImageSettings::default()
        };
        let schema = ChannelSchema::build(&image, &[]);
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.offset(&ChannelKind::Intensity), Some(0));
        assert_eq!(schema.offset(&ChannelKind::Time), Some(1));
        assert_eq!(schema.offset(&ChannelKind::Tau), Some(2));
        assert_eq!(schema.offset(&ChannelKind::Lambda), None);
    }

    #[test]
    fn polarization_widens_the_light_block() {
        let image = ImageSettings {
            light: true,
            polarization: true,
            lambda: true,
            ..ImageSettings::default()
        };
        let schema = ChannelSchema::build(&image, &[]);
        assert_eq!(schema.offset(&ChannelKind::StokesV), Some(3));
        assert_eq!(schema.offset(&ChannelKind::Lambda), Some(4));
    }

    #[test]
    fn cell_value_channels_expand_per_name() {
        let image = ImageSettings {
            light: false,
            lambda_ave: true,
            tau_int: true,
            ..ImageSettings::default()
        };
        let names = vec!["rho".to_string(), "pgas".to_string()];
        let schema = ChannelSchema::build(&image, &names);
        assert_eq!(schema.len(), 4);
        assert_eq!(schema.offset(&ChannelKind::LambdaAve(1)), Some(1));
        assert_eq!(schema.offset(&ChannelKind::TauInt(0)), Some(2));
        assert_eq!(schema.names()[3], "tau_int_pgas");
    }
}
