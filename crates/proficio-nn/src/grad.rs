//! Gradient accumulators
//!
//! Backward passes add into a `GradientStore` keyed by the same dot-names
//! the parameter registry uses, so `grads.get("head.classifier.weight")`
//! lines up with the checkpoint tensor of that name. Frozen tensors never
//! receive an entry.

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayView1};

use crate::NamedTensor;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientStore {
    tensors: BTreeMap<String, NamedTensor>,
}

impl GradientStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, name: String, shape: &[usize]) -> &mut NamedTensor {
        self.tensors.entry(name).or_insert_with_key(|name| {
            let numel = shape.iter().product();
            NamedTensor::new(name.clone(), shape.to_vec(), vec![0.0; numel], true)
        })
    }

    /// Add `values` elementwise into the tensor `name` of the given shape
    pub fn accumulate(
        &mut self,
        name: String,
        shape: &[usize],
        values: impl IntoIterator<Item = f32>,
    ) {
        let slot = self.slot(name, shape);
        for (acc, v) in slot.data.iter_mut().zip(values) {
            *acc += v;
        }
    }

    pub fn accumulate_array1(&mut self, name: String, values: &Array1<f32>) {
        self.accumulate(name, &[values.len()], values.iter().copied());
    }

    /// Add the outer product `x ⊗ g` into a `[x.len(), g.len()]` tensor
    pub fn accumulate_outer(&mut self, name: String, x: ArrayView1<f32>, g: ArrayView1<f32>) {
        let slot = self.slot(name, &[x.len(), g.len()]);
        let cols = g.len();
        for (r, &xr) in x.iter().enumerate() {
            if xr == 0.0 {
                continue;
            }
            let row = &mut slot.data[r * cols..(r + 1) * cols];
            for (acc, &gc) in row.iter_mut().zip(g.iter()) {
                *acc += xr * gc;
            }
        }
    }

    pub fn accumulate_scalar(&mut self, name: String, value: f32) {
        self.accumulate(name, &[], [value]);
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedTensor> {
        self.tensors.values()
    }

    /// Sum another store into this one
    pub fn merge(&mut self, other: &GradientStore) {
        for tensor in other.iter() {
            self.accumulate(
                tensor.name.clone(),
                &tensor.shape,
                tensor.data.iter().copied(),
            );
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for tensor in self.tensors.values_mut() {
            tensor.data.iter_mut().for_each(|v| *v *= factor);
        }
    }

    /// L2 norm over every accumulated value
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .values()
            .flat_map(|t| t.data.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    pub fn into_tensors(self) -> Vec<NamedTensor> {
        self.tensors.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_outer_product_layout() {
        let mut grads = GradientStore::new();
        grads.accumulate_outer("w".into(), array![1.0, 2.0].view(), array![3.0, 4.0, 5.0].view());
        let w = grads.get("w").unwrap();
        assert_eq!(w.shape, vec![2, 3]);
        assert_eq!(w.data, vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_accumulates_and_merges() {
        let mut a = GradientStore::new();
        a.accumulate_array1("b".into(), &array![1.0, 1.0]);
        a.accumulate_array1("b".into(), &array![0.5, -1.0]);
        a.accumulate_scalar("alpha".into(), 2.0);

        let mut b = GradientStore::new();
        b.accumulate_array1("b".into(), &array![1.0, 1.0]);
        b.merge(&a);
        b.scale(0.5);

        assert_eq!(b.get("b").unwrap().data, vec![1.25, 0.5]);
        assert_eq!(b.get("alpha").unwrap().data, vec![1.0]);
        assert_eq!(b.names().collect::<Vec<_>>(), vec!["alpha", "b"]);
        assert!((b.global_norm() - (1.25f32 * 1.25 + 0.25 + 1.0).sqrt()).abs() < 1e-6);
    }
}
