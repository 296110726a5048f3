/// Implements `RpcFunction::signature`.
///
/// `signature!(infer ["a", "b"])` names the parameters and takes their types
/// from `Self::Domain`; `signature!(["a": Type::Int] => Type::Int)` spells
/// every type out.
#[macro_export]
macro_rules! signature {
    ([$($param:literal : $ty:expr),* $(,)?] => $range:expr) => {
        fn signature(&self) -> $crate::Signature {
            $crate::Signature::new([$(($param, $ty)),*], $range)
        }
    };
    (infer [$($param:literal),* $(,)?]) => {
        fn signature(&self) -> $crate::Signature {
            $crate::Signature::infer::<Self::Domain, Self::Range>(&[$($param),*])
        }
    };
}

#[macro_export]
macro_rules! name {
    ($name:expr) => {
        fn name(&self) -> &str {
            $name
        }
    };
}
