/// Hyperbolic tangent.
#[derive(Clone, Debug, Default)]
pub struct Tanh;

impl Tanh {
    pub fn f(&self, z: f32) -> f32 {
        z.tanh()
    }

    pub fn df(&self, z: f32) -> f32 {
        1. - z.tanh().powi(2)
    }
}

#[derive(Clone, Debug)]
pub enum ActFn {
    Tanh(Tanh),
}

impl ActFn {
    pub fn tanh() -> Self {
        ActFn::Tanh(Tanh)
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            ActFn::Tanh(a) => a.f(x),
        }
    }

    pub fn df(&self, x: f32) -> f32 {
        match self {
            ActFn::Tanh(a) => a.df(x),
        }
    }
}
