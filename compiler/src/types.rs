//! Semantic types and their register footprint.
//!
//! Types are structural. A named type is a transparent alias that keeps
//! its name only for display; comparisons go through [`Typ::normalized`],
//! which strips aliases and redundant single-field tuples at every depth.
//!
//! Sizes are measured in 32-bit registers:
//!
//! ```text
//! int float char bool ptr fn   1
//! void                         0
//! char N                       ceil(N / 4)    packed bytes
//! bool N                       ceil(N / 32)   packed bits
//! T N                          size(T) * N
//! (a: A, b: B, ...)            size(A) + size(B) + ...
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Typ {
    Int,
    Float,
    Char,
    Bool,
    #[default]
    Void,
    /// User-declared alias: `: point = (x: int, y: int)`
    Named(String, Box<Typ>),
    Array(Box<Typ>, usize),
    Tuple(Vec<TypField>),
    Pointer(Box<Typ>),
    Function(Box<Arrow>),
}

/// A function type `input > output`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arrow {
    pub input: Typ,
    pub output: Typ,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypField {
    pub name: Option<String>,
    pub ty: Typ,
}

impl Arrow {
    pub fn new(input: Typ, output: Typ) -> Self {
        Self { input, output }
    }

    pub fn normalized(&self) -> Arrow {
        Arrow::new(self.input.normalized(), self.output.normalized())
    }

    /// `void > void` is what every function literal starts with before
    /// inference gives it a type.
    pub fn is_unset(&self) -> bool {
        self.input == Typ::Void && self.output == Typ::Void
    }
}

impl Typ {
    /// The built-in types every root scope starts with.
    pub fn defaults() -> [(&'static str, Typ); 5] {
        [
            ("int", Typ::Int),
            ("float", Typ::Float),
            ("char", Typ::Char),
            ("bool", Typ::Bool),
            ("void", Typ::Void),
        ]
    }

    pub fn function(input: Typ, output: Typ) -> Typ {
        Typ::Function(Box::new(Arrow::new(input, output)))
    }

    /// Register footprint.
    pub fn size(&self) -> usize {
        match self {
            Typ::Int | Typ::Float | Typ::Char | Typ::Bool => 1,
            Typ::Pointer(_) | Typ::Function(_) => 1,
            Typ::Void => 0,
            Typ::Named(_, target) => target.size(),
            Typ::Array(elem, count) => match elem.resolved() {
                Typ::Char => (count + 3) / 4,
                Typ::Bool => (count + 31) / 32,
                elem => elem.size() * count,
            },
            Typ::Tuple(fields) => fields.iter().map(|f| f.ty.size()).sum(),
        }
    }

    /// Look through aliases and single unlabelled tuples, one level deep.
    pub fn resolved(&self) -> &Typ {
        match self {
            Typ::Named(_, target) => target.resolved(),
            Typ::Tuple(fields) if fields.len() == 1 && fields[0].name.is_none() => {
                fields[0].ty.resolved()
            }
            other => other,
        }
    }

    /// Structural form with every alias and redundant tuple removed.
    pub fn normalized(&self) -> Typ {
        match self.resolved() {
            Typ::Array(elem, count) => Typ::Array(Box::new(elem.normalized()), *count),
            Typ::Tuple(fields) => Typ::Tuple(
                fields
                    .iter()
                    .map(|f| TypField {
                        name: f.name.clone(),
                        ty: f.ty.normalized(),
                    })
                    .collect(),
            ),
            Typ::Pointer(inner) => Typ::Pointer(Box::new(inner.normalized())),
            Typ::Function(arrow) => Typ::Function(Box::new(arrow.normalized())),
            scalar => scalar.clone(),
        }
    }

    /// Same type after normalization.
    pub fn matches(&self, other: &Typ) -> bool {
        self.normalized() == other.normalized()
    }

    pub fn arrow(&self) -> Option<&Arrow> {
        match self.resolved() {
            Typ::Function(arrow) => Some(arrow),
            _ => None,
        }
    }

    /// Values that live in one register and take part in integer arithmetic.
    pub fn is_integral(&self) -> bool {
        matches!(self.resolved(), Typ::Int | Typ::Char | Typ::Bool)
    }

    /// Field offsets and types of a tuple, in register units.
    pub fn field(&self, name: &str) -> Option<(usize, &Typ)> {
        let Typ::Tuple(fields) = self.resolved() else {
            return None;
        };
        let mut offset = 0;
        for field in fields {
            if field.name.as_deref() == Some(name) {
                return Some((offset, &field.ty));
            }
            offset += field.ty.size();
        }
        None
    }
}

impl fmt::Display for Typ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Typ::Int => write!(f, "int"),
            Typ::Float => write!(f, "float"),
            Typ::Char => write!(f, "char"),
            Typ::Bool => write!(f, "bool"),
            Typ::Void => write!(f, "void"),
            Typ::Named(name, _) => write!(f, "{}", name),
            Typ::Array(elem, count) => write!(f, "{}[{}]", elem, count),
            Typ::Pointer(inner) => write!(f, "ptr<{}>", inner),
            Typ::Function(arrow) => write!(f, "{}", arrow),
            Typ::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(name) = &field.name {
                        write!(f, "{}: ", name)?;
                    }
                    write!(f, "{}", field.ty)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Arrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.input {
            Typ::Function(_) => write!(f, "({}) > {}", self.input, self.output),
            _ => write!(f, "{} > {}", self.input, self.output),
        }
    }
}
