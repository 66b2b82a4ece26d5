use std::fmt::{self, Debug};

/// transition callback, receives the new value
pub(crate) type Observer = Box<dyn Fn(bool) + Send + Sync>;

/// ordered subscriber lists for one timing phase of a gate
///
/// `any` runs first for every transition, then the list matching the new value.
#[derive(Default)]
pub(crate) struct Observers {
    any: Vec<Observer>,
    on_true: Vec<Observer>,
    on_false: Vec<Observer>,
}

impl Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Observers{{ any: {}, true: {}, false: {} }}",
            self.any.len(),
            self.on_true.len(),
            self.on_false.len()
        )
    }
}

impl Observers {
    pub fn add_any(&mut self, f: Observer) {
        self.any.push(f);
    }

    pub fn add_true(&mut self, f: Observer) {
        self.on_true.push(f);
    }

    pub fn add_false(&mut self, f: Observer) {
        self.on_false.push(f);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.on_true.is_empty() && self.on_false.is_empty()
    }

    pub fn raise(&self, value: bool) {
        for f in &self.any {
            f(value);
        }
        let edge = if value { &self.on_true } else { &self.on_false };
        for f in edge {
            f(value);
        }
    }
}
