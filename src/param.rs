use crate::constant::ParamStatus;
use crate::protocol::type_info::TypeInfo;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    In,
    Out,
}

/// One RPC parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    /// Empty for positional parameters
    pub name: String,
    pub type_info: TypeInfo,
    pub value: Value,
    pub direction: Direction,
}

impl ParamDescriptor {
    /// Input parameter typed from its value
    pub fn input(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: String::new(),
            type_info: TypeInfo::for_value(&value),
            value,
            direction: Direction::In,
        }
    }

    /// Output parameter sent as NULL
    pub fn output(type_info: TypeInfo) -> Self {
        Self {
            name: String::new(),
            type_info,
            value: Value::Null,
            direction: Direction::Out,
        }
    }

    pub fn typed(type_info: TypeInfo, value: impl Into<Value>) -> Self {
        Self {
            name: String::new(),
            type_info,
            value: value.into(),
            direction: Direction::In,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn status(&self) -> ParamStatus {
        match self.direction {
            Direction::In => ParamStatus::empty(),
            Direction::Out => ParamStatus::BY_REF_VALUE,
        }
    }
}

impl From<Value> for ParamDescriptor {
    fn from(value: Value) -> Self {
        Self::input(value)
    }
}
