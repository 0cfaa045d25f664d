use std::{collections::HashMap, fmt::Display, str::FromStr};

use anyhow::anyhow;

use crate::config::{ActionSpec, KeyboardConfig};

/// A resolved command. Carries no state of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    SetRate(f64),
    AdjustRate(f64),
    SeekBy(f64),
}

impl From<ActionSpec> for Action {
    fn from(value: ActionSpec) -> Self {
        match value {
            ActionSpec::SetRate { rate } => Self::SetRate(rate),
            ActionSpec::AdjustRate { step } => Self::AdjustRate(step),
            ActionSpec::SeekBy { seconds } => Self::SeekBy(seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

impl FromStr for Modifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ctrl" | "control" => Ok(Self::Ctrl),
            "alt" => Ok(Self::Alt),
            "shift" => Ok(Self::Shift),
            "meta" | "cmd" => Ok(Self::Meta),
            other => Err(anyhow!("Unknown modifier '{other}'")),
        }
    }
}

impl Display for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ctrl => "ctrl",
            Self::Alt => "alt",
            Self::Shift => "shift",
            Self::Meta => "meta",
        };
        f.write_str(name)
    }
}

/// Modifier keys held while a key event fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    pub fn holds(&self, modifier: Modifier) -> bool {
        match modifier {
            Modifier::Ctrl => self.ctrl,
            Modifier::Alt => self.alt,
            Modifier::Shift => self.shift,
            Modifier::Meta => self.meta,
        }
    }

    pub fn press(&mut self, modifier: Modifier) {
        match modifier {
            Modifier::Ctrl => self.ctrl = true,
            Modifier::Alt => self.alt = true,
            Modifier::Shift => self.shift = true,
            Modifier::Meta => self.meta = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>, modifiers: &[Modifier]) -> Self {
        let mut held = Modifiers::default();
        for modifier in modifiers {
            held.press(*modifier);
        }
        Self {
            key: key.into(),
            modifiers: held,
        }
    }
}

/// Parses chords like `alt+shift+d`. The last segment is the key.
impl FromStr for KeyEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.trim().split('+').collect();
        let key = parts.pop().filter(|key| !key.is_empty());
        let Some(key) = key else {
            return Err(anyhow!("Key chord '{s}' has no key"));
        };
        let mut modifiers = Modifiers::default();
        for part in parts {
            modifiers.press(part.parse()?);
        }
        Ok(Self {
            key: key.to_string(),
            modifiers,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    action: Action,
    modifiers: Vec<Modifier>,
}

/// Maps key events to actions.
///
/// A binding matches when the key is equal and every modifier listed for the
/// binding is held. Modifiers the binding does not list are not checked.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    bindings: HashMap<String, Binding>,
}

impl ActionRegistry {
    pub fn from_config(config: &KeyboardConfig) -> Self {
        let bindings = config
            .actions
            .iter()
            .map(|(key, binding)| {
                let names = binding
                    .modifiers
                    .as_ref()
                    .unwrap_or(&config.default_modifiers);
                let binding = Binding {
                    action: binding.action.into(),
                    modifiers: parse_modifiers(key, names),
                };
                (key.clone(), binding)
            })
            .collect();
        Self { bindings }
    }

    pub fn bind(&mut self, key: impl Into<String>, modifiers: &[Modifier], action: Action) {
        self.bindings.insert(
            key.into(),
            Binding {
                action,
                modifiers: modifiers.to_vec(),
            },
        );
    }

    pub fn resolve(&self, event: &KeyEvent) -> Option<Action> {
        let binding = self.bindings.get(&event.key)?;
        binding
            .modifiers
            .iter()
            .all(|modifier| event.modifiers.holds(*modifier))
            .then_some(binding.action)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn parse_modifiers(key: &str, names: &[String]) -> Vec<Modifier> {
    names
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(modifier) => Some(modifier),
            Err(err) => {
                log::warn!("Ignoring modifier in binding for '{key}': {err}");
                None
            }
        })
        .collect()
}
