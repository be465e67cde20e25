//! Contract interface of the monitored protocol adapter.

use alloy_sol_types::sol;

sol! {
    event TransactionExecuted(bytes32[] tags, bytes32[] logicRefs);
    event CommitmentTreeRootAdded(bytes32 root);
    event ActionExecuted(bytes32 actionTreeRoot, uint256 actionTagCount);

    event ResourcePayload(bytes32 indexed tag, uint256 index, bytes blob);
    event DiscoveryPayload(bytes32 indexed tag, uint256 index, bytes blob);
    event ExternalPayload(bytes32 indexed tag, uint256 index, bytes blob);
    event ApplicationPayload(bytes32 indexed tag, uint256 index, bytes blob);

    struct LogicVerifierInput {
        bytes32 tag;
        bytes32 verifyingKey;
        bytes proof;
    }

    struct ComplianceVerifierInput {
        bytes proof;
        bytes32 consumedNullifier;
        bytes32 consumedLogicRef;
        bytes32 createdCommitment;
        bytes32 createdLogicRef;
    }

    struct Action {
        LogicVerifierInput[] logicVerifierInputs;
        ComplianceVerifierInput[] complianceVerifierInputs;
    }

    struct Transaction {
        Action[] actions;
        bytes deltaProof;
        bytes aggregationProof;
    }

    function execute(Transaction transaction) external;
    function commitmentCount() external view returns (uint256);
}
