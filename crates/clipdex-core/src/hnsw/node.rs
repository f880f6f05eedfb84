//! Adjacency lists for one graph node

/// A node exists on layers `0..=max_layer`; layer 0 holds every node.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub layers: Vec<Vec<u32>>,
}

impl Node {
    pub fn new(max_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); max_layer + 1],
        }
    }

    pub fn max_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn neighbors(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set_neighbors(&mut self, layer: usize, neighbors: Vec<u32>) {
        if let Some(slot) = self.layers.get_mut(layer) {
            *slot = neighbors;
        }
    }

    /// Returns false when the edge already existed or the layer is absent.
    pub fn add_neighbor(&mut self, layer: usize, neighbor: u32) -> bool {
        match self.layers.get_mut(layer) {
            Some(list) if !list.contains(&neighbor) => {
                list.push(neighbor);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_and_dedup() {
        let mut node = Node::new(2);
        assert_eq!(node.max_layer(), 2);
        assert!(node.add_neighbor(0, 7));
        assert!(!node.add_neighbor(0, 7));
        assert!(!node.add_neighbor(5, 1));
        assert_eq!(node.neighbors(0), &[7]);
        assert!(node.neighbors(3).is_empty());
    }
}
