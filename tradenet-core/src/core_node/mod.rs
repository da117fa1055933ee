/*
    core_node - a complete data node

    `DataNode` wires the store components, the broadcast router and the
    persistence bridge together and owns their lifecycle:

      new()       build components, nothing runs yet
      start()     restore from disk -> start event dispatch -> router ready
                  -> background loops (expiry sweep, snapshots, sequence writer)
      shutdown()  cancel pending broadcasts -> stop loops -> drain events
                  -> final snapshot
*/

mod error;
mod node;

pub use error::{NodeError, NodeResult};
pub use node::{Collaborators, DataNode, NodeState};
