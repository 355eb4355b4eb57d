use std::borrow::Cow;

/// Display language for label text. Picked once at construction; the accessor core itself only
/// ever sees raw codes and label keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    De,
}

/// Turns the catalog's opaque label keys into text for people.
pub trait LabelResolver {
    fn resolve<'a>(&self, key: &'a str) -> Cow<'a, str>;
}

/// Built-in resolver with the handful of texts the CLI needs. Keys without a translation render
/// as themselves, which keeps unknown labels diagnosable.
pub struct PlainLabels {
    language: Language,
}

impl PlainLabels {
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

impl LabelResolver for PlainLabels {
    fn resolve<'a>(&self, key: &'a str) -> Cow<'a, str> {
        let text = match (self.language, key) {
            (Language::En, "standby") => "Standby",
            (Language::En, "heating") => "Heating",
            (Language::En, "cooling") => "Cooling",
            (Language::En, "defrosting") => "Defrosting",
            (Language::En, "hot_water_production") => "Hot water production",
            (Language::En, "lowering") => "Setback",
            (Language::En, "summer") => "Summer",
            (Language::En, "automatic_1") => "Automatic 1",
            (Language::En, "automatic_2") => "Automatic 2",
            (Language::En, "off") => "Off",
            (Language::De, "standby") => "Bereitschaft",
            (Language::De, "heating") => "Heizen",
            (Language::De, "cooling") => "Kühlen",
            (Language::De, "defrosting") => "Abtauen",
            (Language::De, "hot_water_production") => "Warmwasserbereitung",
            (Language::De, "lowering") => "Absenken",
            (Language::De, "summer") => "Sommer",
            (Language::De, "automatic_1") => "Automatik 1",
            (Language::De, "automatic_2") => "Automatik 2",
            (Language::De, "off") => "Aus",
            _ => return Cow::Borrowed(key),
        };
        Cow::Borrowed(text)
    }
}
