use crate::value::Value;

/// A column value with its dirty flag
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColValue {
    value: Value,
    updated: bool,
}

impl ColValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            updated: false,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Set by a caller's update, cleared by every fetch
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn set(&mut self, value: Value) {
        self.value = value;
        self.updated = true;
    }
}

/// One row of values, sized to the column set that produced it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowBuffer {
    cols: Vec<ColValue>,
}

impl RowBuffer {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            cols: values.into_iter().map(ColValue::new).collect(),
        }
    }

    /// An all-NULL row with nothing marked updated
    pub fn empty(len: usize) -> Self {
        Self {
            cols: vec![ColValue::default(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// 0-based access
    pub fn get(&self, index: usize) -> Option<&ColValue> {
        self.cols.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ColValue> {
        self.cols.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColValue> {
        self.cols.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.cols.iter().map(ColValue::value)
    }

    pub fn is_dirty(&self) -> bool {
        self.cols.iter().any(ColValue::is_updated)
    }
}
