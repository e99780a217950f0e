use core::fmt;

use crate::{Graph, Node, Stamp};

/// Prints one node per line, in allocation order:
///
/// ```text
/// n7 = Add(n5, n6) : i32 [0, 10]
/// n8 = LoadIndexed(n2, n7) -> n9
/// ```
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph {} ({} nodes, {:?}) {{",
            self.method(),
            self.node_count(),
            self.state().guards_stage()
        )?;
        for node in self.node_snapshot() {
            f.write_str("  ")?;
            self.fmt_node(node, f)?;
            f.write_str("\n")?;
        }
        f.write_str("}")
    }
}

impl Graph {
    fn fmt_node(&self, node: Node, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{node} = {}", self.kind(node))?;
        let inputs = self.inputs(node);
        if !inputs.is_empty() {
            f.write_str("(")?;
            for (i, input) in inputs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{input}")?;
            }
            f.write_str(")")?;
        }
        match self.stamp(node) {
            Stamp::Void => (),
            stamp => write!(f, " : {stamp}")?,
        }
        let mut successors = self.successors(node).peekable();
        if successors.peek().is_some() {
            f.write_str(" ->")?;
            for succ in successors {
                write!(f, " {succ}")?;
            }
        }
        if let Some(position) = self.position(node) {
            write!(f, " @{position}")?;
        }
        Ok(())
    }

    /// Render a single node the way it appears in the graph dump
    pub fn display_node(&self, node: Node) -> impl fmt::Display + '_ {
        struct DisplayNode<'a>(&'a Graph, Node);
        impl fmt::Display for DisplayNode<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt_node(self.1, f)
            }
        }
        DisplayNode(self, node)
    }
}
